//! Flash programming orchestration
//!
//! Drives an ECU reprogramming run over a [`UdsClient`]: enter the
//! programming session, unlock security, erase the affected regions, push
//! each block through RequestDownload / TransferData / RequestTransferExit,
//! then optionally read everything back and compare.
//!
//! ```text
//! Idle -> EnteringProgramming -> Unlocking -> Erasing -> Writing -> Verifying -> Done
//!            |                      |            |          |           |
//!            +----------------- any failure -> Failed <-----+-----------+
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use opendiag_uds::{NegativeResponseCode, RoutineControl, SeedToKey, UdsClient, UdsError, UdsSession};

use crate::error::FlashError;
use crate::file::{find_region_for_address, FlashBlock, FlashFile, FlashRegion};

/// Progress callback: `(operation, current, total, message)`, invoked at
/// every stage transition and block boundary.
pub type ProgressCallback = Arc<dyn Fn(&str, usize, usize, &str) + Send + Sync>;

/// Stages of a programming run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    EnteringProgramming,
    Unlocking,
    Erasing,
    Writing,
    Verifying,
    Done,
    Failed,
}

impl FlashState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Done | Self::Failed)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::EnteringProgramming => "EnteringProgramming",
            Self::Unlocking => "Unlocking",
            Self::Erasing => "Erasing",
            Self::Writing => "Writing",
            Self::Verifying => "Verifying",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Programming run configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// TransferData chunk size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Per-operation deadline in milliseconds, applied on top of the UDS
    /// client's own response timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    /// Read every block back and compare after writing.
    #[serde(default = "default_true")]
    pub verify_after_write: bool,
    /// Run the erase routine for affected regions before writing.
    #[serde(default = "default_true")]
    pub erase_before_write: bool,
    /// Security access level to unlock before programming; 0 disables the
    /// unlock stage.
    #[serde(default = "default_security_level")]
    pub security_level: u8,
    /// Routine identifier of the manufacturer's erase routine.
    #[serde(default = "default_erase_routine_id")]
    pub erase_routine_id: u16,
    /// Base DID for the per-block verification fallback when the ECU does
    /// not support ReadMemoryByAddress.
    #[serde(default = "default_verify_did_base")]
    pub verify_did_base: u16,
    /// Seed-to-key derivation for the unlock stage. Not serializable;
    /// always injected by the caller.
    #[serde(skip)]
    pub seed_to_key: Option<SeedToKey>,
    /// Known flash memory layout. When present, every block must fall in
    /// a non-protected region.
    #[serde(default)]
    pub regions: Vec<FlashRegion>,
}

fn default_block_size() -> u32 {
    256
}

fn default_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_security_level() -> u8 {
    1
}

fn default_erase_routine_id() -> u16 {
    0xFF00
}

fn default_verify_did_base() -> u16 {
    0x0100
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            timeout_ms: default_timeout_ms(),
            verify_after_write: default_true(),
            erase_before_write: default_true(),
            security_level: default_security_level(),
            erase_routine_id: default_erase_routine_id(),
            verify_did_base: default_verify_did_base(),
            seed_to_key: None,
            regions: Vec::new(),
        }
    }
}

impl fmt::Debug for FlashConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashConfig")
            .field("block_size", &self.block_size)
            .field("timeout_ms", &self.timeout_ms)
            .field("verify_after_write", &self.verify_after_write)
            .field("erase_before_write", &self.erase_before_write)
            .field("security_level", &self.security_level)
            .field("erase_routine_id", &self.erase_routine_id)
            .field("verify_did_base", &self.verify_did_base)
            .field("seed_to_key", &self.seed_to_key.as_ref().map(|_| "<callback>"))
            .field("regions", &self.regions)
            .finish()
    }
}

/// Counters for one programming run. Reads return a snapshot.
#[derive(Debug, Clone)]
pub struct FlashStatistics {
    pub total_blocks: usize,
    pub blocks_written: usize,
    pub blocks_failed: usize,
    pub total_bytes: usize,
    pub bytes_written: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlashStatistics {
    fn new() -> Self {
        Self {
            total_blocks: 0,
            blocks_written: 0,
            blocks_failed: 0,
            total_bytes: 0,
            bytes_written: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Wall-clock duration of the run so far (or of the whole run once
    /// finished).
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Average write throughput in bytes per second.
    pub fn average_speed(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_written as f64 / secs
        }
    }
}

/// Orchestrates ECU reprogramming over a UDS client.
pub struct FlashManager {
    uds: Arc<UdsClient>,
    config: FlashConfig,
    op_timeout: Duration,
    state: RwLock<FlashState>,
    stats: Mutex<FlashStatistics>,
}

impl FlashManager {
    pub fn new(uds: Arc<UdsClient>, config: FlashConfig) -> Self {
        let op_timeout = Duration::from_millis(u64::from(config.timeout_ms));
        Self {
            uds,
            config,
            op_timeout,
            state: RwLock::new(FlashState::Idle),
            stats: Mutex::new(FlashStatistics::new()),
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn state(&self) -> FlashState {
        *self.state.read()
    }

    pub fn statistics(&self) -> FlashStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = FlashStatistics::new();
    }

    /// Run a full programming cycle for `file`.
    ///
    /// On failure the manager still attempts a transfer exit and a return
    /// to the default session before reporting the error.
    pub async fn program(
        &self,
        file: &FlashFile,
        progress: Option<ProgressCallback>,
    ) -> Result<FlashStatistics, FlashError> {
        {
            let mut state = self.state.write();
            if !state.is_terminal() {
                return Err(FlashError::Busy);
            }
            *state = FlashState::EnteringProgramming;
        }

        if let Err(e) = self.validate_file(file) {
            *self.state.write() = FlashState::Failed;
            return Err(e);
        }

        {
            let mut stats = self.stats.lock();
            *stats = FlashStatistics::new();
            stats.total_blocks = file.blocks().len();
            stats.total_bytes = file.total_size();
        }
        info!(
            blocks = file.blocks().len(),
            bytes = file.total_size(),
            "starting flash programming"
        );

        let result = self.run_stages(file, progress.as_ref()).await;
        self.stats.lock().finished_at = Some(Utc::now());

        match result {
            Ok(()) => {
                *self.state.write() = FlashState::Done;
                let stats = self.statistics();
                info!(
                    blocks = stats.blocks_written,
                    bytes = stats.bytes_written,
                    elapsed_ms = stats.elapsed().as_millis() as u64,
                    "flash programming complete"
                );
                Ok(stats)
            }
            Err(e) => {
                *self.state.write() = FlashState::Failed;
                warn!(error = %e, "flash programming failed, cleaning up");
                // Best-effort cleanup; the ECU may already be unreachable.
                let _ = self.bounded(self.uds.request_transfer_exit()).await;
                let _ = self
                    .bounded(self.uds.diagnostic_session_control(UdsSession::Default))
                    .await;
                Err(e)
            }
        }
    }

    /// Read each block's region back and compare byte for byte. Uses
    /// ReadMemoryByAddress, falling back to per-block DID reads when the
    /// ECU rejects the service.
    pub async fn verify(
        &self,
        file: &FlashFile,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), FlashError> {
        let blocks = file.blocks();
        for (index, block) in blocks.iter().enumerate() {
            report(
                progress,
                "Verifying",
                index,
                blocks.len(),
                &format!("Block {} @ 0x{:08X}", index + 1, block.address),
            );

            let read_back = match self
                .bounded(
                    self.uds
                        .read_memory_by_address(block.address, block.data.len() as u32),
                )
                .await
            {
                Ok(data) => data,
                Err(UdsError::NegativeResponse {
                    nrc: NegativeResponseCode::ServiceNotSupported,
                    ..
                }) => {
                    debug!("ReadMemoryByAddress unsupported, falling back to DID reads");
                    let did = self.config.verify_did_base.wrapping_add(index as u16);
                    self.bounded(self.uds.read_data_by_id(did))
                        .await
                        .map_err(|e| FlashError::VerificationRead {
                            address: block.address,
                            source: e,
                        })?
                }
                Err(e) => {
                    return Err(FlashError::VerificationRead {
                        address: block.address,
                        source: e,
                    })
                }
            };

            if let Some(offset) = first_mismatch(&block.data, &read_back) {
                return Err(FlashError::VerificationMismatch {
                    address: block.address + offset as u32,
                });
            }
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        file: &FlashFile,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), FlashError> {
        // Stage: enter the programming session.
        report(progress, "EnteringProgramming", 0, 1, "requesting programming session");
        self.bounded(self.uds.diagnostic_session_control(UdsSession::Programming))
            .await
            .map_err(FlashError::BootloaderEntry)?;

        // Stage: security unlock.
        if self.config.security_level > 0 {
            if let Some(derive) = self.config.seed_to_key.clone() {
                self.set_state(FlashState::Unlocking);
                report(progress, "Unlocking", 0, 1, "requesting security access");
                self.bounded(self.uds.unlock_security(self.config.security_level, &derive))
                    .await
                    .map_err(FlashError::SecurityDenied)?;
            }
        }

        // Stage: erase the affected regions.
        if self.config.erase_before_write {
            self.set_state(FlashState::Erasing);
            let targets: Vec<&FlashRegion> = self
                .config
                .regions
                .iter()
                .filter(|r| !r.protected)
                .filter(|r| file.blocks().iter().any(|b| r.overlaps_block(b)))
                .collect();

            for (index, region) in targets.iter().enumerate() {
                report(
                    progress,
                    "Erasing",
                    index,
                    targets.len(),
                    &format!("region {} @ 0x{:08X}", region.name, region.start_address),
                );
                let mut params = region.start_address.to_be_bytes().to_vec();
                params.extend_from_slice(&region.size().to_be_bytes());
                self.bounded(self.uds.routine_control(
                    RoutineControl::Start,
                    self.config.erase_routine_id,
                    &params,
                ))
                .await
                .map_err(|e| FlashError::Erase {
                    address: region.start_address,
                    source: e,
                })?;
            }
        }

        // Stage: write every block in ascending address order.
        self.set_state(FlashState::Writing);
        let mut blocks: Vec<&FlashBlock> = file.blocks().iter().collect();
        blocks.sort_by_key(|b| b.address);

        for (index, block) in blocks.iter().enumerate() {
            report(
                progress,
                "Programming",
                index,
                blocks.len(),
                &format!("Block {} @ 0x{:08X}", index + 1, block.address),
            );
            if let Err(e) = self.write_block(block).await {
                self.stats.lock().blocks_failed += 1;
                return Err(e);
            }
            self.stats.lock().blocks_written += 1;
        }

        // Stage: read back and compare.
        if self.config.verify_after_write {
            self.set_state(FlashState::Verifying);
            self.verify(file, progress).await?;
        }

        report(progress, "Complete", 1, 1, "programming finished");
        Ok(())
    }

    async fn write_block(&self, block: &FlashBlock) -> Result<(), FlashError> {
        let failed = |address: u32| {
            move |source: UdsError| FlashError::Programming { address, source }
        };

        self.bounded(
            self.uds
                .request_download(block.address, block.data.len() as u32),
        )
        .await
        .map_err(failed(block.address))?;

        // Sequence counter restarts at 1 for every download and wraps
        // 0xFF back to 1.
        let mut sequence: u8 = 1;
        let mut offset = 0usize;
        for chunk in block.data.chunks(self.config.block_size as usize) {
            self.bounded(self.uds.transfer_data(sequence, chunk))
                .await
                .map_err(failed(block.address + offset as u32))?;
            offset += chunk.len();
            self.stats.lock().bytes_written += chunk.len();
            sequence = if sequence == 0xFF { 1 } else { sequence + 1 };
        }

        self.bounded(self.uds.request_transfer_exit())
            .await
            .map_err(failed(block.address))?;
        Ok(())
    }

    fn validate_file(&self, file: &FlashFile) -> Result<(), FlashError> {
        if !file.validate() {
            return Err(FlashError::InvalidFile(
                "image is empty or has overlapping blocks".into(),
            ));
        }

        if !self.config.regions.is_empty() {
            for block in file.blocks() {
                let region = find_region_for_address(block.address, &self.config.regions)
                    .ok_or(FlashError::InvalidAddress(block.address))?;
                if !region.contains(block.end_address()) {
                    return Err(FlashError::InvalidAddress(block.end_address()));
                }
                if region.protected {
                    return Err(FlashError::RegionProtected(block.address));
                }
            }
        }
        Ok(())
    }

    fn set_state(&self, state: FlashState) {
        debug!(%state, "flash stage");
        *self.state.write() = state;
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, UdsError>>,
    ) -> Result<T, UdsError> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(UdsError::Timeout),
        }
    }
}

fn report(progress: Option<&ProgressCallback>, operation: &str, current: usize, total: usize, message: &str) {
    if let Some(cb) = progress {
        cb(operation, current, total, message);
    }
}

fn first_mismatch(expected: &[u8], actual: &[u8]) -> Option<usize> {
    if expected.len() != actual.len() {
        return Some(expected.len().min(actual.len()));
    }
    expected.iter().zip(actual).position(|(a, b)| a != b)
}
