//! Passive HTTP/1.1 traffic inspection
//!
//! The inspector never alters the bytes it sees. It recognizes request and
//! status lines, header blocks and bodies framed by `content-length` or
//! chunked transfer encoding, and reports them as [`ProtocolData`] events.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::util::random_id;

/// Lookahead limit for header blocks and chunk size lines
pub const MAX_HEADER_LEN: usize = 4096;

/// Body bytes kept per message; longer bodies are counted, not stored
pub const MAX_BODY_CAPTURE: usize = 1024 * 1024;

/// Loop iterations without progress before the parser gives up
const MAX_GUARD: usize = 100;

/// Characters `decodeURI` leaves escaped in logged paths
const RESERVED: &[u8] = b";/?:@&=+$,#";

/// Unanswered requests remembered for response pairing
const MAX_PENDING_REQUESTS: usize = 64;

const REQUEST_ID_LEN: usize = 12;
const REQUEST_SIG: &[u8] = b"HTTP/1.1\r\n";
const RESPONSE_SIG: &[u8] = b"HTTP/1.1 ";
const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("Internal parser error: no progress in state {0:?}")]
    NoProgress(ParseState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolDataKind {
    HttpRequestHeader,
    HttpRequestBody,
    HttpResponseHeader,
    HttpResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// One observed step of an HTTP exchange
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolData {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProtocolDataKind,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<HttpHeader>,
    /// Body as captured, at most [`MAX_BODY_CAPTURE`] bytes
    #[serde(skip)]
    pub content: Option<Bytes>,
    /// Full body size seen on the wire
    pub body_len: usize,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

impl ProtocolData {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Unknown,
    ResponseHeader,
    RequestHeader,
    ChunkSize,
    ChunkData { remaining: usize },
    FixedBody { remaining: usize },
}

#[derive(Debug, Clone)]
struct RequestInfo {
    id: String,
    method: String,
    path: String,
    start_at: DateTime<Utc>,
}

/// The message whose body is currently being read
#[derive(Debug)]
struct Exchange {
    id: String,
    method: String,
    path: String,
    status: u16,
    status_text: String,
    headers: Vec<HttpHeader>,
    is_request: bool,
    start_at: DateTime<Utc>,
}

enum Step {
    Continue,
    NeedMore,
}

/// Counts parser steps that leave both the buffer and the state untouched
#[derive(Default)]
struct ProgressGuard {
    stalls: usize,
}

impl ProgressGuard {
    fn check(
        &mut self,
        before: (usize, ParseState),
        after: (usize, ParseState),
    ) -> Result<(), InspectorError> {
        if before != after {
            self.stalls = 0;
            return Ok(());
        }
        self.stalls += 1;
        if self.stalls >= MAX_GUARD {
            return Err(InspectorError::NoProgress(after.1));
        }
        Ok(())
    }
}

/// Incremental parser for one direction of a connection
pub struct HttpInspector {
    state: ParseState,
    buf: BytesMut,
    body: BytesMut,
    body_len: usize,
    skip_crlf: usize,
    current: Option<Exchange>,
    pending: Arc<Mutex<VecDeque<RequestInfo>>>,
}

impl Default for HttpInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpInspector {
    pub fn new() -> Self {
        Self::with_queue(Arc::new(Mutex::new(VecDeque::new())))
    }

    /// Inspectors for the request and response direction of one connection
    ///
    /// Responses seen by the second inspector carry the id, method and path of
    /// the oldest unanswered request seen by the first one.
    pub fn pair() -> (Self, Self) {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        (Self::with_queue(queue.clone()), Self::with_queue(queue))
    }

    fn with_queue(pending: Arc<Mutex<VecDeque<RequestInfo>>>) -> Self {
        Self {
            state: ParseState::Unknown,
            buf: BytesMut::new(),
            body: BytesMut::new(),
            body_len: 0,
            skip_crlf: 0,
            current: None,
            pending,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Feed the next chunk of the stream and collect completed events
    ///
    /// On error the parser resets itself and resynchronizes on the next
    /// request or status line.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ProtocolData>, InspectorError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut guard = ProgressGuard::default();

        while !self.buf.is_empty() {
            let before = (self.buf.len(), self.state);
            if let Step::NeedMore = self.step(&mut events) {
                break;
            }
            if let Err(e) = guard.check(before, (self.buf.len(), self.state)) {
                self.reset();
                return Err(e);
            }
        }
        Ok(events)
    }

    pub fn reset(&mut self) {
        self.state = ParseState::Unknown;
        self.buf.clear();
        self.body.clear();
        self.body_len = 0;
        self.skip_crlf = 0;
        self.current = None;
    }

    fn step(&mut self, events: &mut Vec<ProtocolData>) -> Step {
        if self.skip_crlf > 0 {
            while self.skip_crlf > 0 && matches!(self.buf.first(), Some(b'\r' | b'\n')) {
                self.buf.advance(1);
                self.skip_crlf -= 1;
            }
            // Anything else after a chunk is not ours to skip
            if !self.buf.is_empty() {
                self.skip_crlf = 0;
            }
            return Step::Continue;
        }

        match self.state {
            ParseState::Unknown | ParseState::RequestHeader | ParseState::ResponseHeader => {
                self.parse_head(events)
            }
            ParseState::ChunkSize => self.parse_chunk_size(events),
            ParseState::ChunkData { remaining } => {
                let take = remaining.min(self.buf.len());
                let data = self.buf.split_to(take);
                self.capture(&data);
                let remaining = remaining - take;
                if remaining == 0 {
                    self.skip_crlf = CRLF.len();
                    self.state = ParseState::ChunkSize;
                } else {
                    self.state = ParseState::ChunkData { remaining };
                }
                Step::Continue
            }
            ParseState::FixedBody { remaining } => {
                let take = remaining.min(self.buf.len());
                let data = self.buf.split_to(take);
                self.capture(&data);
                let remaining = remaining - take;
                if remaining == 0 {
                    self.finish_body(events);
                } else {
                    self.state = ParseState::FixedBody { remaining };
                }
                Step::Continue
            }
        }
    }

    fn parse_head(&mut self, events: &mut Vec<ProtocolData>) -> Step {
        let request = find(&self.buf, REQUEST_SIG);
        let response = find(&self.buf, RESPONSE_SIG);
        match (request, response) {
            (Some(req), Some(res)) if res < req => self.parse_status_line(res, events),
            (Some(req), _) => self.parse_request_line(req, events),
            (None, Some(res)) => self.parse_status_line(res, events),
            (None, None) => {
                self.keep_last_line();
                Step::NeedMore
            }
        }
    }

    fn parse_request_line(&mut self, sig: usize, events: &mut Vec<ProtocolData>) -> Step {
        let line_end = sig + REQUEST_SIG.len() - CRLF.len();
        let line_start = self.buf[..sig]
            .iter()
            .rposition(|&b| b == b'\n' || b == b'\r')
            .map_or(0, |p| p + 1);

        let banner = String::from_utf8_lossy(&self.buf[line_start..line_end]).into_owned();
        let parts: Vec<&str> = banner.split(' ').collect();
        if sig - line_start > MAX_HEADER_LEN || parts.len() != 3 || parts[0].is_empty() {
            self.buf.advance(line_end + CRLF.len());
            return Step::Continue;
        }

        let Some(head_end) = self.find_header_end(line_end) else {
            return self.wait_for_head(line_start, line_end);
        };
        let headers = parse_headers(&self.buf[line_end + CRLF.len()..head_end]);
        self.buf.advance(head_end);

        let now = Utc::now();
        let info = RequestInfo {
            id: random_id(REQUEST_ID_LEN),
            method: parts[0].to_uppercase(),
            path: percent_decode(parts[1]),
            start_at: now,
        };
        {
            let mut pending = self.pending.lock();
            if pending.len() >= MAX_PENDING_REQUESTS {
                pending.pop_front();
            }
            pending.push_back(info.clone());
        }

        let exchange = Exchange {
            id: info.id,
            method: info.method,
            path: info.path,
            status: 0,
            status_text: String::new(),
            headers,
            is_request: true,
            start_at: now,
        };
        events.push(exchange.event(ProtocolDataKind::HttpRequestHeader, None, Some(now), None));
        self.begin_body(exchange, false);
        Step::Continue
    }

    fn parse_status_line(&mut self, sig: usize, events: &mut Vec<ProtocolData>) -> Step {
        let search_end = self.buf.len().min(sig + MAX_HEADER_LEN);
        let Some(line_len) = find(&self.buf[sig..search_end], CRLF) else {
            if self.buf.len() - sig >= MAX_HEADER_LEN {
                self.buf.advance(sig + RESPONSE_SIG.len());
                return Step::Continue;
            }
            self.buf.advance(sig);
            return Step::NeedMore;
        };
        let line_end = sig + line_len;

        let banner = String::from_utf8_lossy(&self.buf[sig..line_end]).into_owned();
        let mut parts = banner.splitn(3, ' ');
        let _version = parts.next();
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|s| (100..=999).contains(s));
        let Some(status) = status else {
            self.buf.advance(line_end + CRLF.len());
            return Step::Continue;
        };
        let status_text = parts.next().unwrap_or_default().to_string();

        let Some(head_end) = self.find_header_end(line_end) else {
            return self.wait_for_head(sig, line_end);
        };
        let headers = parse_headers(&self.buf[line_end + CRLF.len()..head_end]);
        self.buf.advance(head_end);

        let now = Utc::now();
        // Interim responses leave the request waiting for its final answer
        let request = if status < 200 {
            self.pending.lock().front().cloned()
        } else {
            self.pending.lock().pop_front()
        };
        let (id, method, path, start_at) = match request {
            Some(r) => (r.id, r.method, r.path, r.start_at),
            None => (random_id(REQUEST_ID_LEN), String::new(), String::new(), now),
        };
        let no_body = method == "HEAD" || status < 200 || status == 204 || status == 304;

        let exchange = Exchange {
            id,
            method,
            path,
            status,
            status_text,
            headers,
            is_request: false,
            start_at,
        };
        events.push(exchange.event(
            ProtocolDataKind::HttpResponseHeader,
            None,
            Some(start_at),
            Some(now),
        ));
        self.begin_body(exchange, no_body);
        Step::Continue
    }

    fn parse_chunk_size(&mut self, events: &mut Vec<ProtocolData>) -> Step {
        let search_end = self.buf.len().min(MAX_HEADER_LEN);
        let Some(line_len) = find(&self.buf[..search_end], CRLF) else {
            if self.buf.len() >= MAX_HEADER_LEN {
                self.abandon();
                return Step::Continue;
            }
            return Step::NeedMore;
        };

        let line = String::from_utf8_lossy(&self.buf[..line_len]).into_owned();
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16);
        self.buf.advance(line_len + CRLF.len());

        match size {
            Ok(0) => {
                self.skip_crlf = CRLF.len();
                self.finish_body(events);
            }
            Ok(remaining) => self.state = ParseState::ChunkData { remaining },
            Err(_) => self.abandon(),
        }
        Step::Continue
    }

    /// Keep the partial head from `line_start` unless it can no longer fit
    fn wait_for_head(&mut self, line_start: usize, line_end: usize) -> Step {
        if self.buf.len() - line_end >= MAX_HEADER_LEN + HEADER_END.len() {
            self.buf.advance(line_end + CRLF.len());
            self.abandon();
            return Step::Continue;
        }
        self.buf.advance(line_start);
        Step::NeedMore
    }

    fn find_header_end(&self, from: usize) -> Option<usize> {
        let search_end = self.buf.len().min(from + MAX_HEADER_LEN + HEADER_END.len());
        find(&self.buf[from..search_end], HEADER_END).map(|p| from + p + HEADER_END.len())
    }

    /// Drop everything but the trailing line fragment
    fn keep_last_line(&mut self) {
        let start = self
            .buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |p| p + 1);
        let keep_from = if self.buf.len() - start > MAX_HEADER_LEN {
            self.buf.len() - (REQUEST_SIG.len() - 1)
        } else {
            start
        };
        self.buf.advance(keep_from);
    }

    fn begin_body(&mut self, exchange: Exchange, no_body: bool) {
        let chunked = exchange
            .headers
            .iter()
            .any(|h| h.name == "transfer-encoding" && h.value.to_lowercase().contains("chunked"));
        let content_length = exchange
            .headers
            .iter()
            .find(|h| h.name == "content-length")
            .and_then(|h| h.value.parse::<usize>().ok())
            .unwrap_or(0);

        self.body.clear();
        self.body_len = 0;
        self.state = if no_body {
            header_state(exchange.is_request)
        } else if chunked {
            ParseState::ChunkSize
        } else if content_length > 0 {
            ParseState::FixedBody {
                remaining: content_length,
            }
        } else {
            header_state(exchange.is_request)
        };
        self.current = Some(exchange);
    }

    fn capture(&mut self, data: &[u8]) {
        self.body_len += data.len();
        let room = MAX_BODY_CAPTURE.saturating_sub(self.body.len());
        self.body.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn finish_body(&mut self, events: &mut Vec<ProtocolData>) {
        let content = self.body.split().freeze();
        let body_len = std::mem::take(&mut self.body_len);
        match self.current.take() {
            Some(exchange) => {
                let kind = if exchange.is_request {
                    ProtocolDataKind::HttpRequestBody
                } else {
                    ProtocolDataKind::HttpResponseBody
                };
                let mut event = exchange.event(
                    kind,
                    Some(content),
                    Some(exchange.start_at),
                    Some(Utc::now()),
                );
                event.body_len = body_len;
                events.push(event);
                self.state = header_state(exchange.is_request);
            }
            None => self.state = ParseState::Unknown,
        }
    }

    fn abandon(&mut self) {
        tracing::debug!("Inspector lost sync in state {:?}", self.state);
        self.state = ParseState::Unknown;
        self.body.clear();
        self.body_len = 0;
        self.current = None;
    }
}

impl Exchange {
    fn event(
        &self,
        kind: ProtocolDataKind,
        content: Option<Bytes>,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    ) -> ProtocolData {
        ProtocolData {
            id: self.id.clone(),
            kind,
            method: self.method.clone(),
            path: self.path.clone(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            body_len: content.as_ref().map_or(0, Bytes::len),
            content,
            start_at,
            end_at,
        }
    }
}

fn header_state(is_request: bool) -> ParseState {
    if is_request {
        ParseState::RequestHeader
    } else {
        ParseState::ResponseHeader
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_headers(block: &[u8]) -> Vec<HttpHeader> {
    String::from_utf8_lossy(block)
        .split("\r\n")
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim().to_lowercase();
            let value = value.trim();
            (!name.is_empty() && !value.is_empty()).then(|| HttpHeader {
                name,
                value: value.to_string(),
            })
        })
        .collect()
}

fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                let decoded = hi << 4 | lo;
                if RESERVED.contains(&decoded) {
                    out.extend_from_slice(&bytes[i..i + 3]);
                } else {
                    out.push(decoded);
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, value: &str) -> HttpHeader {
        HttpHeader {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_pipelined_requests_without_body() {
        let mut inspector = HttpInspector::new();
        let events = inspector
            .feed(
                b"GET /fubar%20spaces HTTP/1.1\r\n\
                  Host: server.io\r\n\
                  Cookie: om=nomnom\r\n\
                  \r\n\
                  HEAD /another HTTP/1.1\r\n\
                  Host: server.io\r\n\
                  \r\n",
            )
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ProtocolDataKind::HttpRequestHeader);
        assert_eq!(events[0].method, "GET");
        assert_eq!(events[0].path, "/fubar spaces");
        assert_eq!(
            events[0].headers,
            vec![header("host", "server.io"), header("cookie", "om=nomnom")]
        );
        assert_eq!(events[0].id.len(), REQUEST_ID_LEN);

        assert_eq!(events[1].kind, ProtocolDataKind::HttpRequestHeader);
        assert_eq!(events[1].method, "HEAD");
        assert_eq!(events[1].path, "/another");
        assert_eq!(events[1].headers, vec![header("host", "server.io")]);
        assert_ne!(events[0].id, events[1].id);
        assert_eq!(inspector.state(), ParseState::RequestHeader);
    }

    #[test]
    fn test_single_request_no_body() {
        let mut inspector = HttpInspector::new();
        let events = inspector
            .feed(b"GET /fubar%20spaces HTTP/1.1\r\nHost: server.io\r\n\r\n")
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, "/fubar spaces");
        assert_eq!(events[0].headers, vec![header("host", "server.io")]);
        assert!(events[0].content.is_none());
    }

    #[test]
    fn test_request_without_headers() {
        let mut inspector = HttpInspector::new();
        let events = inspector.feed(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].headers.is_empty());
    }

    #[test]
    fn test_fixed_length_body_across_feeds() {
        let mut inspector = HttpInspector::new();
        let mut events = inspector
            .feed(
                b"POST /push/it HTTP/1.1\r\n\
                  Host: server.io\r\n\
                  Content-Type: text/plain\r\n\
                  Content-Length: 19\r\n\
                  \r\n\
                  THIS_IS",
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(inspector.state(), ParseState::FixedBody { remaining: 12 });

        events.extend(inspector.feed(b"_THE_CONTENT").unwrap());
        assert_eq!(events.len(), 2);

        let body = &events[1];
        assert_eq!(body.kind, ProtocolDataKind::HttpRequestBody);
        assert_eq!(body.method, "POST");
        assert_eq!(body.path, "/push/it");
        assert_eq!(body.id, events[0].id);
        assert_eq!(
            body.headers,
            vec![
                header("host", "server.io"),
                header("content-type", "text/plain"),
                header("content-length", "19"),
            ]
        );
        assert_eq!(body.content.as_deref(), Some(&b"THIS_IS_THE_CONTENT"[..]));
        assert!(body.start_at <= body.end_at);
    }

    #[test]
    fn test_chunked_response_body() {
        let mut inspector = HttpInspector::new();
        let mut events = inspector
            .feed(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: text/plain\r\n\
                  Transfer-Encoding: chunked\r\n\
                  \r\n\
                  7\r\n\
                  THIS_IS\r\n",
            )
            .unwrap();
        events.extend(inspector.feed(b"c\r\n_THE_CONTENT\r\n0\r\n\r\n").unwrap());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ProtocolDataKind::HttpResponseHeader);
        assert_eq!(events[0].status, 200);
        assert_eq!(events[0].status_text, "OK");
        assert_eq!(
            events[0].headers,
            vec![
                header("content-type", "text/plain"),
                header("transfer-encoding", "chunked"),
            ]
        );
        assert_eq!(events[1].kind, ProtocolDataKind::HttpResponseBody);
        assert_eq!(events[1].status, 200);
        assert_eq!(events[1].content.as_deref(), Some(&b"THIS_IS_THE_CONTENT"[..]));
        assert_eq!(inspector.state(), ParseState::ResponseHeader);
    }

    #[test]
    fn test_byte_by_byte_chunked() {
        let stream = b"HTTP/1.1 404 Not Found\r\nTransfer-Encoding: chunked\r\n\r\n\
                       3\r\nabc\r\n0\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let mut inspector = HttpInspector::new();
        let mut events = Vec::new();
        for b in stream.iter() {
            events.extend(inspector.feed(std::slice::from_ref(b)).unwrap());
        }

        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ProtocolDataKind::HttpResponseHeader,
                ProtocolDataKind::HttpResponseBody,
                ProtocolDataKind::HttpResponseHeader,
            ]
        );
        assert_eq!(events[0].status_text, "Not Found");
        assert_eq!(events[1].content.as_deref(), Some(&b"abc"[..]));
        assert_eq!(events[2].status, 204);
    }

    #[test]
    fn test_paired_inspectors_share_request_ids() {
        let (mut requests, mut responses) = HttpInspector::pair();
        let req = requests
            .feed(b"HEAD /status HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap();
        let res = responses
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n")
            .unwrap();

        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, req[0].id);
        assert_eq!(res[0].method, "HEAD");
        assert_eq!(res[0].path, "/status");
        // HEAD responses advertise a length but carry no body
        assert_eq!(responses.state(), ParseState::ResponseHeader);
    }

    #[test]
    fn test_non_http_traffic_is_ignored() {
        let mut inspector = HttpInspector::new();
        let noise = vec![0x16u8; 20_000];
        assert!(inspector.feed(&noise).unwrap().is_empty());
        assert_eq!(inspector.state(), ParseState::Unknown);

        let events = inspector.feed(b"\nGET /late HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, "/late");
    }

    #[test]
    fn test_oversized_header_block_is_abandoned() {
        let mut inspector = HttpInspector::new();
        let mut data = b"GET /big HTTP/1.1\r\nX-Filler: ".to_vec();
        data.extend(std::iter::repeat(b'x').take(MAX_HEADER_LEN * 2));
        assert!(inspector.feed(&data).unwrap().is_empty());
        assert_eq!(inspector.state(), ParseState::Unknown);
    }

    #[test]
    fn test_chunked_request_body() {
        let mut inspector = HttpInspector::new();
        let events = inspector
            .feed(
                b"POST /upload HTTP/1.1\r\n\
                  Transfer-Encoding: chunked\r\n\
                  \r\n\
                  4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n",
            )
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, ProtocolDataKind::HttpRequestBody);
        assert_eq!(events[1].method, "POST");
        assert_eq!(events[1].id, events[0].id);
        assert_eq!(events[1].content.as_deref(), Some(&b"Wikipedia"[..]));
        assert_eq!(events[1].body_len, 9);
        assert_eq!(inspector.state(), ParseState::RequestHeader);
    }

    #[test]
    fn test_transfer_encoding_wins_over_content_length() {
        let mut inspector = HttpInspector::new();
        let events = inspector
            .feed(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Length: 100\r\n\
                  Transfer-Encoding: chunked\r\n\
                  \r\n\
                  5\r\nhello\r\n0\r\n\r\n\
                  HTTP/1.1 204 No Content\r\n\r\n",
            )
            .unwrap();

        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ProtocolDataKind::HttpResponseHeader,
                ProtocolDataKind::HttpResponseBody,
                ProtocolDataKind::HttpResponseHeader,
            ]
        );
        assert_eq!(events[1].content.as_deref(), Some(&b"hello"[..]));
        assert_eq!(events[2].status, 204);
    }

    #[test]
    fn test_bad_chunk_size_abandons_body() {
        let mut inspector = HttpInspector::new();
        let events = inspector
            .feed(
                b"HTTP/1.1 200 OK\r\n\
                  Transfer-Encoding: chunked\r\n\
                  \r\n\
                  zz\r\n",
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(inspector.state(), ParseState::Unknown);

        // Resynchronizes on the next status line
        let events = inspector
            .feed(b"garbage\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].content.as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn test_oversized_chunk_size_line_abandons_body() {
        let mut inspector = HttpInspector::new();
        inspector
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        assert_eq!(inspector.state(), ParseState::ChunkSize);

        let line = vec![b'a'; MAX_HEADER_LEN + 1];
        let events = inspector.feed(&line).unwrap();
        assert!(events.is_empty());
        assert_eq!(inspector.state(), ParseState::Unknown);
    }

    #[test]
    fn test_progress_guard_gives_up_after_stalls() {
        let mut guard = ProgressGuard::default();
        let stuck = (10, ParseState::ChunkSize);
        for _ in 0..MAX_GUARD - 1 {
            guard.check(stuck, stuck).unwrap();
        }
        assert!(matches!(
            guard.check(stuck, stuck),
            Err(InspectorError::NoProgress(ParseState::ChunkSize))
        ));

        // Any progress starts the count over
        let mut guard = ProgressGuard::default();
        for _ in 0..MAX_GUARD - 1 {
            guard.check(stuck, stuck).unwrap();
        }
        guard.check(stuck, (9, ParseState::ChunkSize)).unwrap();
        guard.check(stuck, stuck).unwrap();
    }

    #[test]
    fn test_large_body_is_counted_not_stored() {
        let mut inspector = HttpInspector::new();
        let len = MAX_BODY_CAPTURE + 10;
        let head = format!("POST /big HTTP/1.1\r\nContent-Length: {len}\r\n\r\n");
        let mut events = inspector.feed(head.as_bytes()).unwrap();
        for _ in 0..len / 4096 {
            events.extend(inspector.feed(&[b'x'; 4096]).unwrap());
        }
        events.extend(inspector.feed(&vec![b'x'; len % 4096]).unwrap());
        events.extend(inspector.feed(b"GET /next HTTP/1.1\r\n\r\n").unwrap());

        assert_eq!(events.len(), 3);
        assert_eq!(events[1].kind, ProtocolDataKind::HttpRequestBody);
        assert_eq!(events[1].content.as_ref().map(Bytes::len), Some(MAX_BODY_CAPTURE));
        assert_eq!(events[1].body_len, len);
        assert_eq!(events[2].path, "/next");
    }

    #[test]
    fn test_path_keeps_reserved_escapes() {
        assert_eq!(percent_decode("/a%20b"), "/a b");
        assert_eq!(percent_decode("/a%2Fb%3fc%23d"), "/a%2Fb%3fc%23d");
        assert_eq!(percent_decode("/caf%C3%A9"), "/café");
        assert_eq!(percent_decode("/100%"), "/100%");
        assert_eq!(percent_decode("/%zz"), "/%zz");
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_value(ProtocolDataKind::HttpRequestHeader).unwrap();
        assert_eq!(json, serde_json::json!("http-request-header"));
    }
}
