//! Exposes an in-process HTTP server with canned responses for use in tests.
//!
//! ```
//! use catalog_loadtest_test::server::TestServer;
//! use axum::http::{Method, StatusCode};
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    server.respond(Method::GET, "/health", StatusCode::OK, serde_json::json!({}));
//!    let url = server.url("/health");
//!    // use the URL in tests...
//! }
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};

/// A request the [`TestServer`] received.
#[derive(Clone, Debug)]
pub struct Request {
    /// The request method.
    pub method: Method,
    /// The percent-encoded request path.
    pub path: String,
    /// The raw query string, if any.
    pub query: Option<String>,
    /// All request headers.
    pub headers: HeaderMap,
    /// The request body as text.
    pub body: String,
}

impl Request {
    /// Returns the value of `name` if it is present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

type Routes = HashMap<(Method, String), (StatusCode, serde_json::Value)>;

#[derive(Debug, Default)]
struct Inner {
    routes: Routes,
    requests: Vec<Request>,
}

type Shared = Arc<Mutex<Inner>>;

/// An in-process HTTP server for use in tests.
///
/// Every request is recorded. Requests matching a route registered with
/// [`respond`](Self::respond) get its canned answer, everything else a `404`. The server listens
/// on a random available port on localhost.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    inner: Shared,
}

impl TestServer {
    pub async fn new() -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let inner = Shared::default();
        let app = Router::new().fallback(handle).with_state(inner.clone());

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            inner,
        }
    }

    /// Answers requests to `path` with `status` and a JSON `body`.
    ///
    /// A `null` body sends an empty response. The path must be given percent-encoded.
    pub fn respond(&self, method: Method, path: &str, status: StatusCode, body: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.insert((method, path.to_owned()), (status, body));
    }

    /// Returns all requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.socket.port(), path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle(
    State(inner): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut inner = inner.lock().unwrap();
    inner.requests.push(Request {
        method: method.clone(),
        path: uri.path().to_owned(),
        query: uri.query().map(str::to_owned),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    match inner.routes.get(&(method, uri.path().to_owned())) {
        Some((status, body)) if body.is_null() => status.into_response(),
        Some((status, body)) => (*status, Json(body.clone())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
