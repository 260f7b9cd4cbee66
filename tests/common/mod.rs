//! Shared fixtures for integration tests: a transport answered by hand and
//! an observer that records every event.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use fetch_scheduler::net::{NetworkObserver, Request, Response, SendDecision, Settlement, Transport};
use fetch_scheduler::TransportError;

type Reply = Result<Response, TransportError>;

struct Exchange {
    request: Request,
    reply: oneshot::Sender<Reply>,
}

/// Transport whose exchanges stay open until the test answers them.
#[derive(Default)]
pub struct ScriptedTransport {
    open: Mutex<Vec<Exchange>>,
    sent: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Descriptions of every request that reached the transport, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Answers the oldest open exchange for `url`. Returns false if none is open.
    pub fn reply(&self, url: &str, reply: Reply) -> bool {
        let exchange = {
            let mut open = self.open.lock();
            match open.iter().position(|e| e.request.url() == url) {
                Some(index) => open.remove(index),
                None => return false,
            }
        };
        exchange.reply.send(reply).is_ok()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) -> bool {
        let method = self.method_of(url).unwrap_or(Method::GET);
        self.reply(url, Ok(Response::builder(method, url, status).body(body).build()))
    }

    pub fn respond_with(&self, url: &str, response: Response) -> bool {
        self.reply(url, Ok(response))
    }

    pub fn fail(&self, url: &str, message: &str) -> bool {
        self.reply(url, Err(TransportError::Network(message.to_string())))
    }

    fn method_of(&self, url: &str) -> Option<Method> {
        self.open
            .lock()
            .iter()
            .find(|e| e.request.url() == url)
            .map(|e| e.request.method().clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.sent.lock().push(request.description().to_string());
        self.open.lock().push(Exchange { request, reply: tx });
        rx.await
            .unwrap_or_else(|_| Err(TransportError::Network("exchange dropped".into())))
    }
}

/// Records observer callbacks as short strings.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl NetworkObserver for RecordingObserver {
    fn on_slow(&self) {
        self.events.lock().push("slow".into());
    }

    fn on_recover(&self) {
        self.events.lock().push("recover".into());
    }

    fn before_send(&self, request: &Request) -> SendDecision {
        self.events.lock().push(format!("send {}", request.url()));
        SendDecision::Proceed
    }

    fn on_settled(&self, request: &Request, settlement: &Settlement) {
        self.events
            .lock()
            .push(format!("{} {}", settlement.kind(), request.url()));
    }
}

/// Lets spawned dispatch and settlement tasks run.
pub async fn flush() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
