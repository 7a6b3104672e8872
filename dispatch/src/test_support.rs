//! In-memory transport for dispatcher tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time;

use crate::transport::{Transport, TransportError, TransportFut, TransportRequest, TransportResponse};

#[derive(Debug, Clone)]
pub(crate) enum StubReply {
    Respond(TransportResponse),
    Fail(TransportError),
    Panic,
}

#[derive(Debug, Clone)]
struct Route {
    delay: Duration,
    reply: StubReply,
}

/// Replies keyed by URL path, each after an optional (virtual-clock) delay.
/// Unknown paths answer 404.
#[derive(Debug, Default)]
pub(crate) struct StubTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<TransportRequest>>,
    in_flight: Arc<AtomicUsize>,
}

impl StubTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route(self, path: &str, delay: Duration, reply: StubReply) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Route { delay, reply });
        self
    }

    pub(crate) fn json(self, path: &str, status: u16, body: &Value) -> Self {
        self.route(
            path,
            Duration::ZERO,
            StubReply::Respond(response(status, "application/json", body.to_string())),
        )
    }

    pub(crate) fn text(self, path: &str, status: u16, body: &str) -> Self {
        self.route(
            path,
            Duration::ZERO,
            StubReply::Respond(response(status, "text/plain", body.to_string())),
        )
    }

    pub(crate) fn slow(self, path: &str, delay: Duration) -> Self {
        self.route(
            path,
            delay,
            StubReply::Respond(response(200, "text/plain", "slow".to_string())),
        )
    }

    pub(crate) fn fail(self, path: &str, error: TransportError) -> Self {
        self.route(path, Duration::ZERO, StubReply::Fail(error))
    }

    /// Requests seen so far, in send order.
    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Sends whose futures have not been dropped yet.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub(crate) fn response(status: u16, content_type: &str, body: String) -> TransportResponse {
    TransportResponse {
        status,
        headers: vec![("content-type".to_string(), content_type.to_string())],
        body: body.into_bytes(),
    }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for StubTransport {
    fn send(&self, request: TransportRequest) -> TransportFut<'_> {
        let route = self
            .routes
            .lock()
            .unwrap()
            .get(request.url.path())
            .cloned()
            .unwrap_or(Route {
                delay: Duration::ZERO,
                reply: StubReply::Respond(response(404, "text/plain", "not found".to_string())),
            });
        self.requests.lock().unwrap().push(request);
        let guard = InFlight::enter(&self.in_flight);

        Box::pin(async move {
            let _guard = guard;
            if !route.delay.is_zero() {
                time::sleep(route.delay).await;
            }
            match route.reply {
                StubReply::Respond(response) => Ok(response),
                StubReply::Fail(error) => Err(error),
                StubReply::Panic => panic!("stub transport panicked"),
            }
        })
    }
}
