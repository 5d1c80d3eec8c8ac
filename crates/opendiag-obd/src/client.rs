//! OBD-II client
//!
//! Requests ride the functional broadcast identifier (0x7DF by default)
//! and responses are paired on the configured physical response
//! identifier. Value decoding, supported-PID discovery and trouble-code
//! parsing live here; the periodic worker is in [`crate::monitor`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use opendiag_can::{CanId, CanProtocol, ExchangeClient, ExchangeError};

use crate::config::ObdConfig;
use crate::dtc::{bytes_to_dtc, ObdDtc};
use crate::error::ObdError;
use crate::monitor::{MonitorCallback, MonitorHandle};
use crate::pid::{self, well_known, ObdParameter};
use crate::{ObdMode, POSITIVE_RESPONSE_OFFSET};

/// Supported-PID bucket PIDs, chained while each previous bucket
/// advertises the next.
const SUPPORTED_BUCKETS: &[u8] = &[0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0];

/// Client counters. Reads return a snapshot.
#[derive(Debug, Clone)]
pub struct ObdStatistics {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
}

impl ObdStatistics {
    fn new() -> Self {
        Self {
            requests_sent: 0,
            responses_received: 0,
            timeouts: 0,
            errors: 0,
            started_at: Utc::now(),
        }
    }
}

/// OBD-II client over a shared CAN channel.
pub struct ObdClient {
    exchange: Arc<ExchangeClient>,
    config: ObdConfig,
    request_id: CanId,
    response_id: CanId,
    timeout: Duration,
    supported_pids: RwLock<Option<Vec<u8>>>,
    stats: Arc<Mutex<ObdStatistics>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ObdClient {
    pub fn new(can: Arc<CanProtocol>, config: ObdConfig) -> Result<Self, ObdError> {
        let request_id = CanId::new(config.request_id, config.use_extended_ids)
            .map_err(|e| ObdError::InvalidConfig(e.to_string()))?;
        let response_id = CanId::new(config.response_id, config.use_extended_ids)
            .map_err(|e| ObdError::InvalidConfig(e.to_string()))?;

        let exchange = Arc::new(ExchangeClient::new(can));
        let timeout = Duration::from_millis(u64::from(config.timeout_ms));

        info!(request_id = %request_id, response_id = %response_id, "OBD client ready");
        Ok(Self {
            exchange,
            config,
            request_id,
            response_id,
            timeout,
            supported_pids: RwLock::new(None),
            stats: Arc::new(Mutex::new(ObdStatistics::new())),
            monitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ObdConfig {
        &self.config
    }

    pub fn statistics(&self) -> ObdStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = ObdStatistics::new();
    }

    /// Stop monitoring and cancel in-flight exchanges. The supported-PID
    /// cache dies with the client.
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.exchange.shutdown();
        info!("OBD client shut down");
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    async fn send_obd(&self, payload: &[u8]) -> Result<Vec<u8>, ObdError> {
        let mode = payload[0];
        debug!(mode = format!("0x{mode:02X}"), "OBD request");
        self.stats.lock().requests_sent += 1;

        let response = match self
            .exchange
            .exchange(self.request_id, payload, self.response_id, self.timeout)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let mut stats = self.stats.lock();
                match e {
                    ExchangeError::Timeout => stats.timeouts += 1,
                    _ => stats.errors += 1,
                }
                return Err(e.into());
            }
        };

        self.stats.lock().responses_received += 1;

        match response.first() {
            None => Err(ObdError::InvalidResponse("empty response".into())),
            Some(0x7F) => {
                self.stats.lock().errors += 1;
                Err(ObdError::NegativeResponse {
                    mode,
                    code: response.get(2).copied().unwrap_or(0),
                })
            }
            Some(&echo) if echo == mode.wrapping_add(POSITIVE_RESPONSE_OFFSET) => Ok(response),
            Some(&echo) => Err(ObdError::InvalidResponse(format!(
                "mode echo mismatch: got 0x{echo:02X}, expected 0x{:02X}",
                mode.wrapping_add(POSITIVE_RESPONSE_OFFSET)
            ))),
        }
    }

    /// Raw mode request: `[mode]` or `[mode, pid]` on the wire. Returns
    /// the full response bytes including the mode echo.
    pub async fn raw_request(&self, mode: u8, pid: Option<u8>) -> Result<Vec<u8>, ObdError> {
        let payload: Vec<u8> = match pid {
            Some(pid) => vec![mode, pid],
            None => vec![mode],
        };
        self.send_obd(&payload).await
    }

    async fn request(&self, mode: ObdMode, pid: u8) -> Result<Vec<u8>, ObdError> {
        let pid_arg = mode.takes_pid().then_some(pid);
        self.raw_request(mode.as_u8(), pid_arg).await
    }

    // =========================================================================
    // Mode 0x01: live data
    // =========================================================================

    /// Enumerate supported PIDs by walking the bit-map buckets
    /// (0x00, 0x20, ... 0xC0), chaining while each bucket advertises the
    /// next and stopping at the first empty map. The result is cached for
    /// the life of the client.
    pub async fn supported_pids(&self) -> Result<Vec<u8>, ObdError> {
        if let Some(cached) = self.supported_pids.read().as_ref() {
            return Ok(cached.clone());
        }

        let mut supported = Vec::new();
        for &bucket in SUPPORTED_BUCKETS {
            if bucket != 0x00 && !supported.contains(&bucket) {
                break;
            }

            let response = match self.request(ObdMode::CurrentData, bucket).await {
                Ok(r) => r,
                // An ECU that does not answer a bucket ends the chain.
                Err(ObdError::Timeout) | Err(ObdError::NegativeResponse { .. }) if bucket != 0x00 => break,
                Err(e) => return Err(e),
            };
            if response.len() < 6 || response[1] != bucket {
                break;
            }

            let pids = pid::parse_supported_bitmap(&response[2..6], bucket);
            if pids.is_empty() {
                break;
            }
            supported.extend(pids);
        }

        debug!(count = supported.len(), "supported PIDs discovered");
        *self.supported_pids.write() = Some(supported.clone());
        Ok(supported)
    }

    /// Read and decode one live-data parameter.
    pub async fn read_parameter(&self, pid: u8) -> Result<ObdParameter, ObdError> {
        let response = self.request(ObdMode::CurrentData, pid).await?;
        if response.len() < 3 || response[1] != pid {
            return Err(ObdError::InvalidResponse(format!(
                "PID 0x{pid:02X} echo missing in response"
            )));
        }
        Ok(ObdParameter::decode(pid, response[2..].to_vec()))
    }

    /// Read several parameters, skipping the ones the ECU rejects.
    pub async fn read_parameters(&self, pids: &[u8]) -> Vec<ObdParameter> {
        let mut parameters = Vec::with_capacity(pids.len());
        for &pid in pids {
            match self.read_parameter(pid).await {
                Ok(param) => parameters.push(param),
                Err(e) => debug!(pid = format!("0x{pid:02X}"), error = %e, "parameter read skipped"),
            }
        }
        parameters
    }

    /// Read a freeze-frame value (mode 0x02) for a PID and frame number.
    pub async fn freeze_frame(&self, pid: u8, frame: u8) -> Result<Vec<u8>, ObdError> {
        let response = self
            .send_obd(&[ObdMode::FreezeFrame.as_u8(), pid, frame])
            .await?;
        if response.len() < 3 || response[1] != pid {
            return Err(ObdError::InvalidResponse(format!(
                "PID 0x{pid:02X} echo missing in freeze frame response"
            )));
        }
        Ok(response[2..].to_vec())
    }

    pub async fn engine_rpm(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::ENGINE_RPM).await?.value)
    }

    pub async fn vehicle_speed(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::VEHICLE_SPEED).await?.value)
    }

    pub async fn coolant_temp(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::COOLANT_TEMP).await?.value)
    }

    pub async fn engine_load(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::ENGINE_LOAD).await?.value)
    }

    pub async fn throttle_position(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::THROTTLE_POSITION).await?.value)
    }

    pub async fn fuel_level(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::FUEL_TANK_LEVEL).await?.value)
    }

    pub async fn intake_air_temp(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::INTAKE_AIR_TEMP).await?.value)
    }

    pub async fn maf_rate(&self) -> Result<f64, ObdError> {
        Ok(self.read_parameter(well_known::MAF_RATE).await?.value)
    }

    // =========================================================================
    // Modes 0x03 / 0x04 / 0x07 / 0x0A: trouble codes
    // =========================================================================

    /// Stored (confirmed) DTCs, mode 0x03.
    pub async fn stored_dtcs(&self) -> Result<Vec<ObdDtc>, ObdError> {
        self.read_dtcs(ObdMode::StoredDtcs).await
    }

    /// Pending DTCs, mode 0x07.
    pub async fn pending_dtcs(&self) -> Result<Vec<ObdDtc>, ObdError> {
        self.read_dtcs(ObdMode::PendingDtcs).await
    }

    /// Permanent DTCs, mode 0x0A.
    pub async fn permanent_dtcs(&self) -> Result<Vec<ObdDtc>, ObdError> {
        self.read_dtcs(ObdMode::PermanentDtcs).await
    }

    /// Clear DTCs and stored emissions values, mode 0x04.
    pub async fn clear_dtcs(&self) -> Result<(), ObdError> {
        self.raw_request(ObdMode::ClearDtcs.as_u8(), None).await?;
        Ok(())
    }

    async fn read_dtcs(&self, mode: ObdMode) -> Result<Vec<ObdDtc>, ObdError> {
        let response = self.raw_request(mode.as_u8(), None).await?;
        // <mode+0x40> <count> <DTC pairs...>
        if response.len() < 2 {
            return Err(ObdError::InvalidResponse("DTC response too short".into()));
        }
        let declared = usize::from(response[1]);

        let mut dtcs = Vec::new();
        for pair in response[2..].chunks_exact(2) {
            let raw = u16::from_be_bytes([pair[0], pair[1]]);
            // 00 00 pairs are frame padding
            if raw == 0 {
                continue;
            }
            let mut dtc = ObdDtc::new(bytes_to_dtc(raw));
            match mode {
                ObdMode::PendingDtcs => dtc.pending = true,
                ObdMode::PermanentDtcs => dtc.permanent = true,
                _ => dtc.confirmed = true,
            }
            dtcs.push(dtc);
            if dtcs.len() == declared {
                break;
            }
        }
        Ok(dtcs)
    }

    // =========================================================================
    // Mode 0x09: vehicle information
    // =========================================================================

    /// Read the 17-character VIN (InfoType 0x02). Alphanumeric bytes after
    /// the InfoType echo are concatenated; everything else (padding,
    /// sequence counters) is dropped.
    pub async fn vin(&self) -> Result<String, ObdError> {
        let response = self
            .request(ObdMode::VehicleInfo, well_known::INFO_VIN)
            .await?;
        if response.len() < 3 || response[1] != well_known::INFO_VIN {
            return Err(ObdError::InvalidResponse(
                "InfoType echo missing in VIN response".into(),
            ));
        }

        let vin: String = response[3..]
            .iter()
            .filter(|b| b.is_ascii_alphanumeric())
            .take(17)
            .map(|&b| char::from(b))
            .collect();
        Ok(vin)
    }

    // =========================================================================
    // Periodic monitoring
    // =========================================================================

    /// Start the background monitoring worker. One worker per client; a
    /// second start without a stop fails.
    pub fn start_monitoring(
        self: &Arc<Self>,
        pids: Vec<u8>,
        interval: Duration,
        callback: MonitorCallback,
    ) -> Result<(), ObdError> {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return Err(ObdError::MonitoringActive);
        }
        *slot = Some(MonitorHandle::spawn(
            Arc::clone(self),
            pids,
            interval,
            callback,
        ));
        Ok(())
    }

    /// Stop the monitoring worker, letting an in-flight cycle complete.
    pub async fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }
}

impl Drop for ObdClient {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
    }
}
