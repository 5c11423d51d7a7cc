use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use dertunnel_protocol::token;

use crate::credentials::verify_token;

/// Decides whether a user/token pair may open a tunnel
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, user: &str, token: &str) -> bool;
}

/// Accepts any credentials; only meant for tests and local experiments
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _user: &str, _token: &str) -> bool {
        true
    }
}

struct CacheEntry {
    allowed: bool,
    inserted: Instant,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
}

/// Bounded cache of recent authentication outcomes
///
/// Entries expire after the TTL; the least recently used entry is evicted
/// when the cache is full.
pub struct AuthCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(300))
    }
}

impl AuthCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                entry.last_used = clock;
                return Some(entry.allowed);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: String, allowed: bool) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                allowed,
                inserted: Instant::now(),
                last_used: clock,
            },
        );
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A configured tunnel client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredential {
    pub user: String,
    pub token_hash: String,
}

/// Authenticator over the configured clients list
pub struct ClientRegistry {
    clients: HashMap<String, String>,
    cache: Arc<AuthCache>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<ClientCredential>, cache: Arc<AuthCache>) -> Self {
        let clients = clients
            .into_iter()
            .map(|c| (c.user.to_lowercase(), c.token_hash))
            .collect();
        Self { clients, cache }
    }

    pub fn cache(&self) -> &Arc<AuthCache> {
        &self.cache
    }
}

#[async_trait]
impl Authenticator for ClientRegistry {
    async fn authenticate(&self, user: &str, token: &str) -> bool {
        let (user, token) = if user.is_empty() && token.len() > token::PLAIN_TOKEN_MAX_LEN {
            match token::unpack(token) {
                Ok(packed) => (packed.user, packed.token),
                Err(_) => return false,
            }
        } else {
            (user.to_string(), token.to_string())
        };

        let Some(token_hash) = self.clients.get(&user.to_lowercase()) else {
            return false;
        };

        let cache_key = format!("{user}#{token}");
        if let Some(allowed) = self.cache.get(&cache_key) {
            return allowed;
        }
        let allowed = verify_token(token_hash, &token);
        self.cache.insert(cache_key, allowed);
        allowed
    }
}
