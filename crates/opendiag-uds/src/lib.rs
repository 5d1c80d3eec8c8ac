//! opendiag-uds - UDS (ISO 14229) client
//!
//! Implements the tester side of UDS over the opendiag CAN layer: session
//! control, security access, data identifier reads/writes, DTC readout,
//! routine control, the download services used for flash programming, and
//! a tester-present keepalive for non-default sessions.
//!
//! Requests and responses are paired by transport-level identifier (the
//! request-id → response-id mapping of the exchange layer); NRC 0x78
//! (response pending) never reaches this crate, it is absorbed one layer
//! down.

pub mod client;
pub mod config;
pub mod dtc;
mod error;
pub mod message;
mod nrc;
pub mod session;

pub use client::{RequestCallback, RoutineControl, SeedToKey, UdsClient, UdsStatistics};
pub use config::UdsConfig;
pub use dtc::{Dtc, DtcCount, DtcStatus};
pub use error::UdsError;
pub use message::{UdsMessage, UdsMessageKind};
pub use nrc::NegativeResponseCode;
pub use session::UdsSession;

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    /// Start routine
    pub const START_ROUTINE: u8 = 0x01;
    /// Stop routine
    pub const STOP_ROUTINE: u8 = 0x02;
    /// Request routine results
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// Key off/on reset - simulate ignition cycle
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    /// Soft reset - application-level restart
    pub const SOFT_RESET: u8 = 0x03;
}

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Offset between a request SID and its positive response SID.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Sub-function bit requesting suppression of the positive response.
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;
