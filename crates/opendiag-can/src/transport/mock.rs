//! Mock transport for testing
//!
//! Scripts request/response exchanges at the frame level: each outbound
//! payload is matched against registered rules (exact match first, then
//! prefix) and the rule's reply frames are queued for the next `recv`.
//! Unsolicited frames can be injected directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{CanTransport, TransportError};
use crate::frame::{CanFrame, CanId};

struct MockRule {
    request: Vec<u8>,
    response_id: CanId,
    replies: Vec<Vec<u8>>,
}

/// In-memory transport with scripted responses.
pub struct MockTransport {
    connected: AtomicBool,
    latency: Option<Duration>,
    inbound: Mutex<VecDeque<CanFrame>>,
    sent: Mutex<Vec<CanFrame>>,
    rules: Mutex<Vec<MockRule>>,
    notify: Notify,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            latency: None,
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Simulate per-call transport latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Register a scripted exchange: every sent payload matching `request`
    /// queues all of `replies` (in order) as received frames on
    /// `response_id`.
    pub fn respond(
        &self,
        request: impl Into<Vec<u8>>,
        response_id: CanId,
        replies: Vec<Vec<u8>>,
    ) {
        self.rules.lock().push(MockRule {
            request: request.into(),
            response_id,
            replies,
        });
    }

    /// Queue an unsolicited inbound frame (periodic data, other ECUs).
    pub fn inject(&self, id: CanId, payload: impl Into<Vec<u8>>) {
        let frame = CanFrame::received(id, payload).expect("mock payload within ISO-TP limit");
        self.inbound.lock().push_back(frame);
        self.notify.notify_waiters();
    }

    /// Snapshot of every frame sent through this transport.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    /// Payloads of every sent frame, for asserting on service traffic.
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|f| f.data.clone()).collect()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn queue_replies(&self, request: &[u8]) {
        let rules = self.rules.lock();

        // Exact match first, then prefix match for variable-length requests.
        let rule = rules
            .iter()
            .find(|r| r.request == request)
            .or_else(|| rules.iter().find(|r| request.starts_with(&r.request)));

        if let Some(rule) = rule {
            let mut inbound = self.inbound.lock();
            for reply in &rule.replies {
                let frame = CanFrame::received(rule.response_id, reply.clone())
                    .expect("mock reply within ISO-TP limit");
                inbound.push_back(frame);
            }
        }
    }
}

#[async_trait]
impl CanTransport for MockTransport {
    async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.queue_replies(&frame.data);
        self.sent.lock().push(frame);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Vec<CanFrame>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut inbound = self.inbound.lock();
                if !inbound.is_empty() {
                    return Ok(inbound.drain(..).collect());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
