//! CAN channel handling: validated send, filters, subscriber dispatch
//!
//! A single background worker polls the transport with a short timeout,
//! runs each received frame through the filter set and delivers accepted
//! frames to every subscribed sink, in subscription order, synchronously
//! on the dispatch task. Sinks must not block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{is_valid_baud_rate, CanConfig};
use crate::filter::{CanFilter, FilterId, FilterSet};
use crate::frame::CanFrame;
use crate::transport::{CanTransport, TransportError};

/// Poll window for the dispatch worker. Short enough that shutdown stays
/// responsive.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Consecutive receive errors before the dispatch worker backs off.
const ERROR_SUSPEND_THRESHOLD: u32 = 3;

#[derive(Debug, Error)]
pub enum CanProtocolError {
    #[error("unsupported baud rate {0} bit/s")]
    InvalidBaudRate(u32),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Handle returned by [`CanProtocol::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Receiver for dispatched frames.
///
/// Called synchronously on the dispatch task for every accepted frame, in
/// subscription order. Implementations must return quickly; the component
/// makes no fairness guarantee across slow sinks.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &CanFrame);
}

/// Channel counters. Reads return a snapshot.
#[derive(Debug, Clone)]
pub struct CanStatistics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_filtered: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
}

impl CanStatistics {
    fn new() -> Self {
        Self {
            frames_sent: 0,
            frames_received: 0,
            frames_filtered: 0,
            errors: 0,
            started_at: Utc::now(),
        }
    }
}

/// CAN channel handle: validated send path plus filtered receive dispatch.
pub struct CanProtocol {
    transport: Arc<dyn CanTransport>,
    config: CanConfig,
    filters: Arc<RwLock<FilterSet>>,
    sinks: Arc<RwLock<Vec<(SinkId, Arc<dyn FrameSink>)>>>,
    stats: Arc<Mutex<CanStatistics>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl CanProtocol {
    /// Validate the configuration and wrap the transport.
    pub fn new(
        transport: Arc<dyn CanTransport>,
        config: CanConfig,
    ) -> Result<Self, CanProtocolError> {
        if !is_valid_baud_rate(config.baud_rate) {
            return Err(CanProtocolError::InvalidBaudRate(config.baud_rate));
        }

        debug!(baud_rate = config.baud_rate, "CAN channel configured");
        Ok(Self {
            transport,
            config,
            filters: Arc::new(RwLock::new(FilterSet::new())),
            sinks: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(Mutex::new(CanStatistics::new())),
            dispatch: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &CanConfig {
        &self.config
    }

    /// Validate and transmit one frame.
    pub async fn send(&self, frame: CanFrame) -> Result<(), CanProtocolError> {
        if !frame.is_valid() {
            return Err(CanProtocolError::InvalidFrame(frame.to_string()));
        }

        self.transport.send(frame).await?;
        self.stats.lock().frames_sent += 1;
        Ok(())
    }

    /// Install a receive filter. Filters apply in installation order; the
    /// first match decides.
    pub fn install_filter(&self, filter: CanFilter) -> FilterId {
        let id = FilterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.filters.write().insert(id, filter);
        id
    }

    pub fn remove_filter(&self, id: FilterId) -> bool {
        self.filters.write().remove(id)
    }

    pub fn clear_filters(&self) {
        self.filters.write().clear();
    }

    /// Register a dispatch sink, starting the dispatch worker if it is not
    /// already running. The sink is held as a non-owning handle; drop it by
    /// id with [`CanProtocol::unsubscribe`].
    pub fn subscribe(&self, sink: Arc<dyn FrameSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.write().push((id, sink));
        self.ensure_dispatch();
        id
    }

    /// Remove a sink. When the last sink leaves the dispatch worker pauses
    /// until the next subscription.
    pub fn unsubscribe(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        let removed = sinks.len() != before;
        let empty = sinks.is_empty();
        drop(sinks);

        if empty {
            self.stop_dispatch();
        }
        removed
    }

    pub fn statistics(&self) -> CanStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = CanStatistics::new();
    }

    /// Stop the dispatch worker and close the transport.
    pub async fn shutdown(&self) {
        self.stop_dispatch();
        let handle = self.dispatch.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.transport.close().await;
        debug!("CAN channel shut down");
    }

    fn ensure_dispatch(&self) {
        let mut dispatch = self.dispatch.lock();
        if let Some(handle) = dispatch.as_ref() {
            if !handle.is_finished() && self.running.load(Ordering::SeqCst) {
                return;
            }
        }
        // A paused worker may still be draining its final poll; abort it
        // before starting a fresh one.
        if let Some(handle) = dispatch.take() {
            handle.abort();
        }

        self.running.store(true, Ordering::SeqCst);
        let transport = self.transport.clone();
        let filters = self.filters.clone();
        let sinks = self.sinks.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let cooldown = Duration::from_millis(self.config.error_cooldown_ms);

        *dispatch = Some(tokio::spawn(async move {
            debug!("CAN dispatch worker started");
            let mut consecutive_errors = 0u32;

            while running.load(Ordering::SeqCst) {
                match transport.recv(POLL_INTERVAL).await {
                    Ok(frames) => {
                        consecutive_errors = 0;
                        for frame in frames {
                            let accepted = filters.read().accepts(&frame);
                            {
                                let mut stats = stats.lock();
                                if accepted {
                                    stats.frames_received += 1;
                                } else {
                                    stats.frames_filtered += 1;
                                }
                            }
                            if !accepted {
                                continue;
                            }
                            for (_, sink) in sinks.read().iter() {
                                sink.on_frame(&frame);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CAN receive failed");
                        stats.lock().errors += 1;
                        consecutive_errors += 1;
                        if consecutive_errors >= ERROR_SUSPEND_THRESHOLD {
                            error!(
                                cooldown_ms = cooldown.as_millis() as u64,
                                "suspending CAN dispatch after repeated receive errors"
                            );
                            tokio::time::sleep(cooldown).await;
                            consecutive_errors = 0;
                        }
                    }
                }
            }
            debug!("CAN dispatch worker stopped");
        }));
    }

    fn stop_dispatch(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for CanProtocol {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
    }
}
