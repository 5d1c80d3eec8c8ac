//! OBD-II client configuration

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Configuration for an [`crate::ObdClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObdConfig {
    /// Functional request identifier (tester -> all ECUs).
    #[serde(default = "default_request_id")]
    pub request_id: u32,
    /// Response identifier matched for request pairing.
    #[serde(default = "default_response_id")]
    pub response_id: u32,
    /// Additional ECU response identifiers of interest. Kept for
    /// configuration compatibility; request matching uses `response_id`.
    #[serde(default)]
    pub ecu_ids: HashSet<u32>,
    /// Whether the identifiers above are 29-bit.
    #[serde(default)]
    pub use_extended_ids: bool,
    /// Response deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
}

fn default_request_id() -> u32 {
    0x7DF
}

fn default_response_id() -> u32 {
    0x7E8
}

fn default_timeout_ms() -> u32 {
    1000
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            request_id: default_request_id(),
            response_id: default_response_id(),
            ecu_ids: HashSet::new(),
            use_extended_ids: false,
            timeout_ms: default_timeout_ms(),
        }
    }
}
