//! UDS service layer
//!
//! One method per diagnostic service. Each serializes a request, runs it
//! through the exchange layer, validates the service echo and updates the
//! client's session/security bookkeeping where the service demands it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use opendiag_can::{CanId, CanProtocol, ExchangeClient, ExchangeError};

use crate::config::UdsConfig;
use crate::dtc::{self, Dtc, DtcCount};
use crate::error::UdsError;
use crate::message::{UdsMessage, UdsMessageKind};
use crate::session::UdsSession;
use crate::{routine_sub_function, service_id, SUPPRESS_POSITIVE_RESPONSE};

/// Computes a security key from a seed and level. Key derivation is
/// manufacturer specific and always supplied by the caller.
pub type SeedToKey = Arc<dyn Fn(&[u8], u8) -> Vec<u8> + Send + Sync>;

/// Completion callback for [`UdsClient::send_request_async`].
pub type RequestCallback = Box<dyn FnOnce(Result<UdsMessage, UdsError>) + Send>;

/// RoutineControl (0x31) operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineControl {
    Start,
    Stop,
    RequestResults,
}

impl RoutineControl {
    fn sub_function(self) -> u8 {
        match self {
            Self::Start => routine_sub_function::START_ROUTINE,
            Self::Stop => routine_sub_function::STOP_ROUTINE,
            Self::RequestResults => routine_sub_function::REQUEST_ROUTINE_RESULTS,
        }
    }
}

/// Client counters. Reads return a snapshot.
#[derive(Debug, Clone)]
pub struct UdsStatistics {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub negative_responses: u64,
    pub timeouts: u64,
    pub started_at: DateTime<Utc>,
}

impl UdsStatistics {
    fn new() -> Self {
        Self {
            requests_sent: 0,
            responses_received: 0,
            negative_responses: 0,
            timeouts: 0,
            started_at: Utc::now(),
        }
    }
}

/// UDS client bound to one (request id, response id) pair.
///
/// Requests on a single client are serialized; clients on distinct
/// identifier pairs over the same CAN channel are independent.
pub struct UdsClient {
    exchange: Arc<ExchangeClient>,
    config: UdsConfig,
    request_id: CanId,
    response_id: CanId,
    timeout: Duration,
    session: Arc<RwLock<UdsSession>>,
    unlocked_levels: Arc<RwLock<HashSet<u8>>>,
    stats: Arc<Mutex<UdsStatistics>>,
    keepalive: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl UdsClient {
    /// Bind a client to a CAN channel.
    pub fn new(can: Arc<CanProtocol>, config: UdsConfig) -> Result<Self, UdsError> {
        let request_id = CanId::new(config.request_id, config.use_extended_ids)
            .map_err(|e| UdsError::InvalidConfig(e.to_string()))?;
        let response_id = CanId::new(config.response_id, config.use_extended_ids)
            .map_err(|e| UdsError::InvalidConfig(e.to_string()))?;

        let exchange = Arc::new(ExchangeClient::with_timing(
            can,
            Duration::from_millis(u64::from(config.p2_star_ms)),
            Duration::from_millis(u64::from(config.pending_cap_ms)),
        ));
        let timeout = Duration::from_millis(u64::from(config.timeout_ms));

        info!(request_id = %request_id, response_id = %response_id, "UDS client ready");
        Ok(Self {
            exchange,
            config,
            request_id,
            response_id,
            timeout,
            session: Arc::new(RwLock::new(UdsSession::Default)),
            unlocked_levels: Arc::new(RwLock::new(HashSet::new())),
            stats: Arc::new(Mutex::new(UdsStatistics::new())),
            keepalive: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &UdsConfig {
        &self.config
    }

    pub fn current_session(&self) -> UdsSession {
        *self.session.read()
    }

    pub fn is_unlocked(&self, level: u8) -> bool {
        self.unlocked_levels.read().contains(&level)
    }

    pub fn statistics(&self) -> UdsStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = UdsStatistics::new();
    }

    /// Stop the keepalive ticker and cancel in-flight exchanges.
    pub fn shutdown(&self) {
        self.stop_keepalive();
        self.exchange.shutdown();
        info!("UDS client shut down");
    }

    // =========================================================================
    // Generic request path
    // =========================================================================

    /// Send a raw request and return the decoded response message.
    pub async fn send_request(&self, request: UdsMessage) -> Result<UdsMessage, UdsError> {
        let raw = self.send_service(request.service, &request.data).await?;
        UdsMessage::decode_response(&raw)
            .ok_or_else(|| UdsError::InvalidResponse("undecodable response".into()))
    }

    /// Fire a request from a background task and hand the outcome to
    /// `callback` when it resolves.
    pub fn send_request_async(self: &Arc<Self>, request: UdsMessage, callback: RequestCallback) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            callback(client.send_request(request).await);
        });
    }

    /// Serialize, exchange, validate the echo. Returns the full response
    /// bytes including the response SID.
    async fn send_service(&self, service: u8, data: &[u8]) -> Result<Vec<u8>, UdsError> {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(service);
        payload.extend_from_slice(data);

        debug!(
            service = format!("0x{service:02X}"),
            payload = %hex::encode(&payload),
            "UDS request"
        );
        self.stats.lock().requests_sent += 1;

        let raw = match self
            .exchange
            .exchange(self.request_id, &payload, self.response_id, self.timeout)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                if matches!(e, ExchangeError::Timeout) {
                    self.stats.lock().timeouts += 1;
                }
                return Err(e.into());
            }
        };

        self.stats.lock().responses_received += 1;

        let msg = UdsMessage::decode_response(&raw)
            .ok_or_else(|| UdsError::InvalidResponse("empty or truncated response".into()))?;
        match msg.kind {
            UdsMessageKind::NegativeResponse(nrc) => {
                self.stats.lock().negative_responses += 1;
                if msg.service != service {
                    return Err(UdsError::InvalidResponse(format!(
                        "negative response for service 0x{:02X}, expected 0x{service:02X}",
                        msg.service
                    )));
                }
                debug!(service = format!("0x{service:02X}"), %nrc, "UDS negative response");
                Err(UdsError::from_negative(service, nrc))
            }
            UdsMessageKind::PositiveResponse if msg.service == service => Ok(raw),
            _ => Err(UdsError::InvalidResponse(format!(
                "service echo mismatch: got 0x{:02X}, expected 0x{service:02X}",
                msg.service
            ))),
        }
    }

    // =========================================================================
    // Diagnostic Session Control (0x10) / ECU Reset (0x11)
    // =========================================================================

    /// Switch the diagnostic session. A positive response updates the
    /// cached session and drops every cached security unlock; a negative
    /// response leaves both untouched.
    pub async fn diagnostic_session_control(&self, session: UdsSession) -> Result<(), UdsError> {
        let response = self
            .send_service(
                service_id::DIAGNOSTIC_SESSION_CONTROL,
                &[session.sub_function()],
            )
            .await?;

        // 0x50 [session] [p2 p2* ...] - the timing parameters are optional
        // and ignored when absent.
        if response.len() < 2 || response[1] != session.sub_function() {
            return Err(UdsError::InvalidResponse(
                "session echo missing in SessionControl response".into(),
            ));
        }

        *self.session.write() = session;
        self.unlocked_levels.write().clear();
        info!(%session, "session changed (security re-locked)");

        if session == UdsSession::Default {
            self.stop_keepalive();
        } else {
            self.start_keepalive();
        }
        Ok(())
    }

    /// Reset the ECU. A positive response returns the optional power-down
    /// time and resets the cached session and security state.
    pub async fn ecu_reset(&self, reset_type: u8) -> Result<Option<u8>, UdsError> {
        let response = self.send_service(service_id::ECU_RESET, &[reset_type]).await?;
        if response.len() < 2 {
            return Err(UdsError::InvalidResponse("ECUReset response too short".into()));
        }
        let power_down_time = response.get(2).copied();

        self.stop_keepalive();
        *self.session.write() = UdsSession::Default;
        self.unlocked_levels.write().clear();
        info!("ECU reset, session state back to default");

        Ok(power_down_time)
    }

    /// Reset the cached session and security state without touching the
    /// bus, after an externally observed reset or session lapse.
    pub fn notify_session_lost(&self) {
        self.stop_keepalive();
        *self.session.write() = UdsSession::Default;
        self.unlocked_levels.write().clear();
        info!("session state reset to default (session lost)");
    }

    // =========================================================================
    // Security Access (0x27)
    // =========================================================================

    /// Request the seed for a security level (odd sub-function).
    pub async fn security_access_request_seed(&self, level: u8) -> Result<Vec<u8>, UdsError> {
        if level == 0 {
            return Err(UdsError::InvalidConfig("security level 0 is reserved".into()));
        }
        let sub_function = level * 2 - 1;
        let response = self
            .send_service(service_id::SECURITY_ACCESS, &[sub_function])
            .await?;

        // 0x67 [sub_function] [seed...]
        if response.len() < 2 {
            return Err(UdsError::InvalidResponse("seed response too short".into()));
        }
        Ok(response[2..].to_vec())
    }

    /// Submit the computed key (even sub-function). On success the level
    /// is recorded as unlocked until the next session transition or ECU
    /// reset.
    pub async fn security_access_send_key(&self, level: u8, key: &[u8]) -> Result<(), UdsError> {
        if level == 0 {
            return Err(UdsError::InvalidConfig("security level 0 is reserved".into()));
        }
        let mut data = vec![level * 2];
        data.extend_from_slice(key);
        self.send_service(service_id::SECURITY_ACCESS, &data).await?;

        self.unlocked_levels.write().insert(level);
        info!(level, "security access granted");
        Ok(())
    }

    /// Full seed/key handshake using the supplied derivation. An all-zero
    /// seed means the level is already unlocked.
    pub async fn unlock_security(&self, level: u8, derive: &SeedToKey) -> Result<(), UdsError> {
        let seed = self.security_access_request_seed(level).await?;
        if seed.is_empty() || seed.iter().all(|&b| b == 0) {
            debug!(level, "zero seed, level already unlocked");
            self.unlocked_levels.write().insert(level);
            return Ok(());
        }

        let key = derive(&seed, level);
        self.security_access_send_key(level, &key).await
    }

    // =========================================================================
    // Data by Identifier (0x22 / 0x2E)
    // =========================================================================

    /// Read one data identifier. The DID echo is validated and stripped.
    pub async fn read_data_by_id(&self, did: u16) -> Result<Vec<u8>, UdsError> {
        let response = self
            .send_service(service_id::READ_DATA_BY_ID, &did.to_be_bytes())
            .await?;

        // 0x62 [DID_HI] [DID_LO] [data...]
        if response.len() < 3 || response[1..3] != did.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "DID 0x{did:04X} echo missing in read response"
            )));
        }
        Ok(response[3..].to_vec())
    }

    /// Read several identifiers with one request each, skipping DIDs the
    /// ECU rejects.
    pub async fn read_data_by_ids(&self, dids: &[u16]) -> Vec<(u16, Vec<u8>)> {
        let mut results = Vec::with_capacity(dids.len());
        for &did in dids {
            match self.read_data_by_id(did).await {
                Ok(data) => results.push((did, data)),
                Err(e) => debug!(did = format!("0x{did:04X}"), error = %e, "DID read skipped"),
            }
        }
        results
    }

    /// Write one data identifier; success is the `6E <DID>` echo.
    pub async fn write_data_by_id(&self, did: u16, data: &[u8]) -> Result<(), UdsError> {
        let mut body = did.to_be_bytes().to_vec();
        body.extend_from_slice(data);
        let response = self
            .send_service(service_id::WRITE_DATA_BY_ID, &body)
            .await?;

        if response.len() < 3 || response[1..3] != did.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "DID 0x{did:04X} echo missing in write response"
            )));
        }
        Ok(())
    }

    // =========================================================================
    // DTC services (0x19 / 0x14)
    // =========================================================================

    /// Count DTCs matching a status mask (0x19 / 0x01).
    pub async fn read_dtc_count(&self, status_mask: u8) -> Result<DtcCount, UdsError> {
        let response = self
            .send_service(
                service_id::READ_DTC_INFO,
                &[dtc::sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK, status_mask],
            )
            .await?;
        dtc::parse_dtc_count(&response).map_err(UdsError::InvalidResponse)
    }

    /// Read DTC records matching a status mask (0x19 / 0x02). Returns the
    /// status availability mask and the decoded records.
    pub async fn read_dtcs_by_status(&self, status_mask: u8) -> Result<(u8, Vec<Dtc>), UdsError> {
        let response = self
            .send_service(
                service_id::READ_DTC_INFO,
                &[dtc::sub_function::REPORT_DTC_BY_STATUS_MASK, status_mask],
            )
            .await?;
        dtc::parse_dtc_records(&response).map_err(UdsError::InvalidResponse)
    }

    /// Clear diagnostic information for a 3-byte DTC group
    /// (`dtc_group::ALL` clears everything).
    pub async fn clear_dtcs(&self, group: u32) -> Result<(), UdsError> {
        let bytes = group.to_be_bytes();
        self.send_service(service_id::CLEAR_DIAGNOSTIC_INFO, &bytes[1..4])
            .await?;
        Ok(())
    }

    // =========================================================================
    // Routine Control (0x31)
    // =========================================================================

    /// Start, stop, or query a routine. The routine identifier echo is
    /// validated; the routine status record (if any) is returned.
    pub async fn routine_control(
        &self,
        control: RoutineControl,
        routine_id: u16,
        params: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut body = vec![control.sub_function()];
        body.extend_from_slice(&routine_id.to_be_bytes());
        body.extend_from_slice(params);
        let response = self.send_service(service_id::ROUTINE_CONTROL, &body).await?;

        // 0x71 [sub_function] [RID_HI] [RID_LO] [routineInfo...]
        if response.len() < 4 || response[2..4] != routine_id.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "routine 0x{routine_id:04X} echo missing in response"
            )));
        }
        Ok(response[4..].to_vec())
    }

    // =========================================================================
    // Memory / download services (0x23, 0x34, 0x36, 0x37)
    // =========================================================================

    /// Read a memory window (0x23, 4-byte address and size, big endian).
    pub async fn read_memory_by_address(&self, address: u32, size: u32) -> Result<Vec<u8>, UdsError> {
        let mut body = vec![0x44];
        body.extend_from_slice(&address.to_be_bytes());
        body.extend_from_slice(&size.to_be_bytes());
        let response = self
            .send_service(service_id::READ_MEMORY_BY_ADDRESS, &body)
            .await?;
        Ok(response[1..].to_vec())
    }

    /// Initiate a download (0x34) for `size` bytes at `address`
    /// (dataFormatIdentifier 0x00, ALFID 0x44). Returns the usable chunk
    /// size: the ECU's maxNumberOfBlockLength minus the service overhead.
    pub async fn request_download(&self, address: u32, size: u32) -> Result<u32, UdsError> {
        let mut body = vec![0x00, 0x44];
        body.extend_from_slice(&address.to_be_bytes());
        body.extend_from_slice(&size.to_be_bytes());
        let response = self
            .send_service(service_id::REQUEST_DOWNLOAD, &body)
            .await?;

        // 0x74 [lengthFormatIdentifier] [maxNumberOfBlockLength...]
        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "RequestDownload response too short".into(),
            ));
        }
        let num_bytes = usize::from(response[1] >> 4);
        if response.len() < 2 + num_bytes {
            return Err(UdsError::InvalidResponse(
                "RequestDownload response missing maxBlockLength".into(),
            ));
        }

        let mut max_block_length: u32 = 0;
        for &b in &response[2..2 + num_bytes] {
            max_block_length = (max_block_length << 8) | u32::from(b);
        }
        Ok(max_block_length.saturating_sub(2))
    }

    /// Transfer one data chunk (0x36). Returns the echoed block sequence
    /// counter.
    pub async fn transfer_data(&self, block_sequence: u8, data: &[u8]) -> Result<u8, UdsError> {
        let mut body = vec![block_sequence];
        body.extend_from_slice(data);
        let response = self.send_service(service_id::TRANSFER_DATA, &body).await?;

        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "TransferData response too short".into(),
            ));
        }
        Ok(response[1])
    }

    /// Finish the transfer (0x37). Returns the transfer response record.
    pub async fn request_transfer_exit(&self) -> Result<Vec<u8>, UdsError> {
        let response = self
            .send_service(service_id::REQUEST_TRANSFER_EXIT, &[])
            .await?;
        Ok(response[1..].to_vec())
    }

    // =========================================================================
    // Tester Present (0x3E)
    // =========================================================================

    /// Send a tester present, optionally suppressing the positive
    /// response (sub-function bit 0x80).
    pub async fn tester_present(&self, suppress_response: bool) -> Result<(), UdsError> {
        if suppress_response {
            self.exchange
                .send_only(
                    self.request_id,
                    &[service_id::TESTER_PRESENT, SUPPRESS_POSITIVE_RESPONSE],
                )
                .await?;
            Ok(())
        } else {
            self.send_service(service_id::TESTER_PRESENT, &[0x00]).await?;
            Ok(())
        }
    }

    /// Start the background tester-present ticker. Runs while the session
    /// is non-default; a failed keepalive is treated as a session lapse
    /// and resets the cached state to default.
    fn start_keepalive(&self) {
        self.stop_keepalive();

        let exchange = self.exchange.clone();
        let request_id = self.request_id;
        let response_id = self.response_id;
        let timeout = self.timeout;
        let session = self.session.clone();
        let unlocked = self.unlocked_levels.clone();
        let suppress = self.config.tester_present_suppress_response;
        let interval = Duration::from_millis(self.config.tester_present_interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick resolves immediately

            loop {
                ticker.tick().await;

                if suppress {
                    let payload = [service_id::TESTER_PRESENT, SUPPRESS_POSITIVE_RESPONSE];
                    if let Err(e) = exchange.send_only(request_id, &payload).await {
                        warn!(error = %e, "tester present send failed");
                    }
                } else {
                    let payload = [service_id::TESTER_PRESENT, 0x00];
                    match exchange
                        .exchange(request_id, &payload, response_id, timeout)
                        .await
                    {
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "tester present failed, assuming session lapsed");
                            *session.write() = UdsSession::Default;
                            unlocked.write().clear();
                            break;
                        }
                    }
                }
            }
        });

        *self.keepalive.write() = Some(handle);
        debug!(
            interval_ms = self.config.tester_present_interval_ms,
            "keepalive started"
        );
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.write().take() {
            handle.abort();
            debug!("keepalive stopped");
        }
    }
}

impl Drop for UdsClient {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.write().take() {
            handle.abort();
        }
    }
}
