//! Request/response coordination
//!
//! [`ExchangeClient`] pairs an outbound diagnostic payload with the next
//! inbound frame on the expected response identifier. Before sending it
//! publishes an awaiter keyed by that identifier; a dispatch sink installed
//! on the CAN layer resolves the awaiter when a matching frame arrives.
//!
//! The UDS "response pending" negative response (`7F <sid> 78`) is absorbed
//! here: it extends the deadline by the p2* window and keeps waiting, up to
//! an overall cap, so the service layers above never see NRC 0x78.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::frame::{CanFrame, CanId, MAX_FRAME_LEN};
use crate::protocol::{CanProtocol, CanProtocolError, FrameSink, SinkId};

/// Default extended deadline applied after each response-pending NRC (p2*).
pub const DEFAULT_P2_STAR: Duration = Duration::from_secs(5);

/// Default upper bound on the total wait across pending retries.
pub const DEFAULT_PENDING_CAP: Duration = Duration::from_secs(30);

const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
const NRC_RESPONSE_PENDING: u8 = 0x78;

#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("response timeout")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("exchange cancelled")]
    Cancelled,
}

type AwaiterMap = Arc<Mutex<HashMap<CanId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Dispatch sink that resolves awaiters by frame identifier.
struct AwaiterSink {
    awaiters: AwaiterMap,
}

impl FrameSink for AwaiterSink {
    fn on_frame(&self, frame: &CanFrame) {
        let awaiters = self.awaiters.lock();
        if let Some(tx) = awaiters.get(&frame.id) {
            trace!(id = %frame.id, len = frame.data.len(), "resolving awaiter");
            let _ = tx.send(frame.data.clone());
        }
    }
}

/// Removes the awaiter entry when an exchange ends, however it ends.
struct AwaiterGuard<'a> {
    awaiters: &'a AwaiterMap,
    id: CanId,
}

impl Drop for AwaiterGuard<'_> {
    fn drop(&mut self) {
        self.awaiters.lock().remove(&self.id);
    }
}

/// Request/response coordinator over a shared CAN channel.
///
/// At most one exchange per expected response identifier is outstanding at
/// a time; a second request to the same identifier waits for the first to
/// resolve. Exchanges on distinct identifiers are independent.
pub struct ExchangeClient {
    can: Arc<CanProtocol>,
    awaiters: AwaiterMap,
    serializers: Mutex<HashMap<CanId, Arc<tokio::sync::Mutex<()>>>>,
    sink_id: SinkId,
    p2_star: Duration,
    pending_cap: Duration,
    closed: AtomicBool,
}

impl ExchangeClient {
    pub fn new(can: Arc<CanProtocol>) -> Self {
        Self::with_timing(can, DEFAULT_P2_STAR, DEFAULT_PENDING_CAP)
    }

    /// Override the p2* extension and the overall pending cap.
    pub fn with_timing(can: Arc<CanProtocol>, p2_star: Duration, pending_cap: Duration) -> Self {
        let awaiters: AwaiterMap = Arc::new(Mutex::new(HashMap::new()));
        let sink = Arc::new(AwaiterSink {
            awaiters: awaiters.clone(),
        });
        let sink_id = can.subscribe(sink);

        Self {
            can,
            awaiters,
            serializers: Mutex::new(HashMap::new()),
            sink_id,
            p2_star,
            pending_cap,
            closed: AtomicBool::new(false),
        }
    }

    /// Send `payload` on `request_id` and wait for the next frame on
    /// `response_id`, for at most `timeout` (extended across response
    /// pending NRCs, bounded by the pending cap).
    ///
    /// The returned bytes have the single-frame length tag already
    /// stripped.
    pub async fn exchange(
        &self,
        request_id: CanId,
        payload: &[u8],
        response_id: CanId,
        timeout: Duration,
    ) -> Result<Vec<u8>, ExchangeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Cancelled);
        }

        // Serialize exchanges that share a response identifier.
        let serializer = {
            let mut locks = self.serializers.lock();
            locks
                .entry(response_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _serialized = serializer.lock().await;

        let sid = payload.first().copied().unwrap_or(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.awaiters.lock().insert(response_id, tx);
        let _guard = AwaiterGuard {
            awaiters: &self.awaiters,
            id: response_id,
        };

        self.send_tagged(request_id, payload).await?;

        let started = Instant::now();
        let overall_deadline = started + self.pending_cap;
        let mut deadline = started + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ExchangeError::Timeout);
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Err(_) => return Err(ExchangeError::Timeout),
                Ok(None) => return Err(ExchangeError::Cancelled),
                Ok(Some(raw)) => {
                    let body = strip_single_frame(&raw);
                    if is_response_pending(body, sid) {
                        debug!(sid = format!("0x{sid:02X}"), "response pending, extending deadline");
                        deadline = (Instant::now() + self.p2_star).min(overall_deadline);
                        continue;
                    }
                    return Ok(body.to_vec());
                }
            }
        }
    }

    /// Fire-and-forget send with the same single-frame tagging as
    /// [`ExchangeClient::exchange`]. Used for suppressed-response services.
    pub async fn send_only(&self, request_id: CanId, payload: &[u8]) -> Result<(), ExchangeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Cancelled);
        }
        self.send_tagged(request_id, payload).await
    }

    /// Cancel outstanding exchanges and detach from the CAN layer.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders resolves every waiting exchange as Cancelled.
        self.awaiters.lock().clear();
        self.can.unsubscribe(self.sink_id);
        debug!("exchange client shut down");
    }

    async fn send_tagged(&self, request_id: CanId, payload: &[u8]) -> Result<(), ExchangeError> {
        let frame = build_request_frame(request_id, payload)
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        self.can.send(frame).await.map_err(|e| match e {
            CanProtocolError::Transport(t) => ExchangeError::Transport(t.to_string()),
            other => ExchangeError::Transport(other.to_string()),
        })
    }
}

impl Drop for ExchangeClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tag a diagnostic payload for the wire. Payloads that fit a classic
/// single frame get a one-byte length prefix; longer payloads ride the
/// transport's segmented channel untagged.
fn build_request_frame(id: CanId, payload: &[u8]) -> Result<CanFrame, crate::frame::FrameError> {
    if payload.len() < MAX_FRAME_LEN {
        let mut wire = Vec::with_capacity(payload.len() + 1);
        wire.push(payload.len() as u8);
        wire.extend_from_slice(payload);
        CanFrame::new(id, wire)
    } else {
        CanFrame::segmented(id, payload.to_vec())
    }
}

/// Strip the single-frame length tag when present.
fn strip_single_frame(data: &[u8]) -> &[u8] {
    match data.split_first() {
        Some((&len, rest)) if usize::from(len) == rest.len() && !rest.is_empty() => rest,
        _ => data,
    }
}

fn is_response_pending(body: &[u8], sid: u8) -> bool {
    body.len() >= 3
        && body[0] == NEGATIVE_RESPONSE_SID
        && body[1] == sid
        && body[2] == NRC_RESPONSE_PENDING
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CanConfig;
    use crate::transport::MockTransport;

    fn setup() -> (Arc<MockTransport>, ExchangeClient) {
        let transport = Arc::new(MockTransport::new());
        let can =
            Arc::new(CanProtocol::new(transport.clone(), CanConfig::default()).unwrap());
        (transport, ExchangeClient::new(can))
    }

    #[tokio::test]
    async fn exchange_resolves_matching_frame() {
        let (transport, client) = setup();
        let tx_id = CanId::standard(0x7E0).unwrap();
        let rx_id = CanId::standard(0x7E8).unwrap();
        transport.respond(
            vec![0x02, 0x3E, 0x00],
            rx_id,
            vec![vec![0x02, 0x7E, 0x00]],
        );

        let resp = client
            .exchange(tx_id, &[0x3E, 0x00], rx_id, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(resp, vec![0x7E, 0x00]);
    }

    #[tokio::test]
    async fn exchange_times_out_without_response() {
        let (_transport, client) = setup();
        let tx_id = CanId::standard(0x7E0).unwrap();
        let rx_id = CanId::standard(0x7E8).unwrap();

        let err = client
            .exchange(tx_id, &[0x3E, 0x00], rx_id, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout));
    }

    #[tokio::test]
    async fn response_pending_extends_the_wait() {
        let (transport, client) = setup();
        let tx_id = CanId::standard(0x7E0).unwrap();
        let rx_id = CanId::standard(0x7E8).unwrap();
        // Two pending notices followed by the real answer, all queued on
        // the single request.
        transport.respond(
            vec![0x03, 0x22, 0xF1, 0x90],
            rx_id,
            vec![
                vec![0x03, 0x7F, 0x22, 0x78],
                vec![0x03, 0x7F, 0x22, 0x78],
                vec![0x04, 0x62, 0xF1, 0x90, 0x31],
            ],
        );

        let resp = client
            .exchange(tx_id, &[0x22, 0xF1, 0x90], rx_id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(resp, vec![0x62, 0xF1, 0x90, 0x31]);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_exchange() {
        let (_transport, client) = setup();
        let client = Arc::new(client);
        let tx_id = CanId::standard(0x7E0).unwrap();
        let rx_id = CanId::standard(0x7E8).unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .exchange(tx_id, &[0x22, 0xF1, 0x90], rx_id, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.shutdown();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ExchangeError::Cancelled)));
    }

    #[test]
    fn single_frame_tagging_round_trip() {
        let id = CanId::standard(0x7DF).unwrap();
        let frame = build_request_frame(id, &[0x01, 0x0C]).unwrap();
        assert_eq!(frame.data, vec![0x02, 0x01, 0x0C]);
        assert_eq!(strip_single_frame(&frame.data), &[0x01, 0x0C]);

        // Long payloads are passed through untagged.
        let long = vec![0x36; 200];
        let frame = build_request_frame(id, &long).unwrap();
        assert_eq!(frame.data, long);
        assert_eq!(strip_single_frame(&long), &long[..]);
    }
}
