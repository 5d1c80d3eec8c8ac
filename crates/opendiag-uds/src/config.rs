//! UDS client configuration

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::UdsClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsConfig {
    /// CAN identifier requests are sent on (tester -> ECU).
    #[serde(default = "default_request_id")]
    pub request_id: u32,
    /// CAN identifier responses arrive on (ECU -> tester).
    #[serde(default = "default_response_id")]
    pub response_id: u32,
    /// Whether the identifiers above are 29-bit.
    #[serde(default)]
    pub use_extended_ids: bool,
    /// Ordinary response deadline (p2 client) in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    /// Extended deadline after a response-pending NRC (p2*) in
    /// milliseconds.
    #[serde(default = "default_p2_star_ms")]
    pub p2_star_ms: u32,
    /// Upper bound on the total wait across pending retries, in
    /// milliseconds.
    #[serde(default = "default_pending_cap_ms")]
    pub pending_cap_ms: u32,
    /// ISO-TP extended addressing.
    #[serde(default)]
    pub extended_addressing: bool,
    /// Source address for extended addressing.
    #[serde(default = "default_source_addr")]
    pub source_addr: u8,
    /// Target address for extended addressing.
    #[serde(default = "default_target_addr")]
    pub target_addr: u8,
    /// Tester present interval while in a non-default session, in
    /// milliseconds. Must stay below the session timeout.
    #[serde(default = "default_tester_present_interval_ms")]
    pub tester_present_interval_ms: u64,
    /// Whether the keepalive suppresses the positive response.
    #[serde(default = "default_true")]
    pub tester_present_suppress_response: bool,
}

fn default_request_id() -> u32 {
    0x7E0
}

fn default_response_id() -> u32 {
    0x7E8
}

fn default_timeout_ms() -> u32 {
    50
}

fn default_p2_star_ms() -> u32 {
    5000
}

fn default_pending_cap_ms() -> u32 {
    30_000
}

fn default_source_addr() -> u8 {
    0xF1
}

fn default_target_addr() -> u8 {
    0x10
}

fn default_tester_present_interval_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            request_id: default_request_id(),
            response_id: default_response_id(),
            use_extended_ids: false,
            timeout_ms: default_timeout_ms(),
            p2_star_ms: default_p2_star_ms(),
            pending_cap_ms: default_pending_cap_ms(),
            extended_addressing: false,
            source_addr: default_source_addr(),
            target_addr: default_target_addr(),
            tester_present_interval_ms: default_tester_present_interval_ms(),
            tester_present_suppress_response: default_true(),
        }
    }
}
