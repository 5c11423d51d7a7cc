//! Syntax checks for names that end up in host names or logs

/// Minimum length of a user name
pub const MIN_USER_LEN: usize = 3;

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// A DNS label: alphanumerics and inner hyphens
fn is_valid_label(label: &str) -> bool {
    let Some(first) = label.chars().next() else {
        return false;
    };
    let last = label.chars().next_back().unwrap_or(first);
    first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() && label.chars().all(is_label_char)
}

/// Dot-separated DNS labels, e.g. `tunnel.example.com`
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(is_valid_label)
}

/// Endpoint names and prefixes: at least two characters, no dots
pub fn is_valid_endpoint(name: &str) -> bool {
    name.len() >= 2 && is_valid_label(name)
}

/// User names: letters, digits, `_`, `-` and `.`, at least three long
pub fn is_valid_user(name: &str) -> bool {
    name.len() >= MIN_USER_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
