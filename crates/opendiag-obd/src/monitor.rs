//! Periodic parameter monitoring
//!
//! A single background worker reads a PID list on a fixed interval and
//! hands each batch to the caller's callback. Cancellation is cooperative:
//! the stop signal is observed between cycles, so an in-flight cycle runs
//! to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::ObdClient;
use crate::pid::ObdParameter;

/// Receives each monitoring batch on the worker task.
pub type MonitorCallback = Arc<dyn Fn(Vec<ObdParameter>) + Send + Sync>;

pub(crate) struct MonitorHandle {
    stop_requested: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn spawn(
        client: Arc<ObdClient>,
        pids: Vec<u8>,
        interval: Duration,
        callback: MonitorCallback,
    ) -> Self {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop_signal = Arc::new(Notify::new());
        let requested = stop_requested.clone();
        let signal = stop_signal.clone();

        let handle = tokio::spawn(async move {
            debug!(?pids, interval_ms = interval.as_millis() as u64, "OBD monitoring started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = signal.notified() => break,
                }
                if requested.load(Ordering::SeqCst) {
                    break;
                }

                let mut parameters = Vec::with_capacity(pids.len());
                for &pid in &pids {
                    match client.read_parameter(pid).await {
                        Ok(param) => parameters.push(param),
                        Err(e) => {
                            warn!(pid = format!("0x{pid:02X}"), error = %e, "monitoring read failed")
                        }
                    }
                }

                if !parameters.is_empty() {
                    callback(parameters);
                }
            }
            debug!("OBD monitoring stopped");
        });

        Self {
            stop_requested,
            stop_signal,
            handle,
        }
    }

    /// Signal the worker and wait for the in-flight cycle to finish.
    pub(crate) async fn stop(self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_signal.notify_one();
        let _ = self.handle.await;
    }

    /// Abort without waiting; used on drop.
    pub(crate) fn abort(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}
