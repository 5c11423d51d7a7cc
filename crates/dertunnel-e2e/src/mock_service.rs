//! Local HTTP service exposed through the tunnel in E2E tests
//!
//! Records every request and answers with a configurable response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: Vec<u8>,
    /// Answer with the request body instead of `body`
    echo: bool,
}

pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response: Arc<RwLock<MockResponse>>,
    task: JoinHandle<()>,
}

impl MockHttpService {
    /// Start on an ephemeral port, answering `200 OK`
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests = Arc::new(RwLock::new(Vec::new()));
        let response = Arc::new(RwLock::new(MockResponse {
            status: StatusCode::OK,
            body: b"OK".to_vec(),
            echo: false,
        }));

        let task = tokio::spawn({
            let requests = requests.clone();
            let response = response.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let requests = requests.clone();
                    let response = response.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            handle(req, requests.clone(), response.clone())
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            }
        });

        Self {
            addr,
            requests,
            response,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    pub fn set_response(&self, status: StatusCode, body: impl Into<Vec<u8>>) {
        let mut response = self.response.write();
        response.status = status;
        response.body = body.into();
        response.echo = false;
    }

    /// Answer every request with its own body
    pub fn echo_bodies(&self) {
        self.response.write().echo = true;
    }
}

impl Drop for MockHttpService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(
    req: Request<Incoming>,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response: Arc<RwLock<MockResponse>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    let reply = response.read().clone();
    let reply_body = if reply.echo { body.clone() } else { reply.body };
    requests.write().push(RecordedRequest {
        method,
        uri,
        headers,
        body,
    });

    let mut resp = Response::new(Full::new(Bytes::from(reply_body)));
    *resp.status_mut() = reply.status;
    Ok(resp)
}
