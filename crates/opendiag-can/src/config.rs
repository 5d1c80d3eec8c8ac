//! CAN channel configuration

use serde::{Deserialize, Serialize};

/// Baud rates accepted by [`crate::CanProtocol`].
pub const STANDARD_BAUD_RATES: &[u32] = &[
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

/// Whether a baud rate is one of the standard CAN rates.
pub fn is_valid_baud_rate(baud_rate: u32) -> bool {
    STANDARD_BAUD_RATES.contains(&baud_rate)
}

/// Configuration for a CAN channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanConfig {
    /// Bus bitrate in bits per second; must be a standard rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Listen-only mode (no acknowledgement, no transmission).
    #[serde(default)]
    pub listen_only: bool,
    /// Loopback mode for self-test.
    #[serde(default)]
    pub loopback: bool,
    /// Whether 29-bit identifiers are expected on this channel.
    #[serde(default = "default_true")]
    pub extended_frames: bool,
    /// Transmit timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub tx_timeout_ms: u32,
    /// Receive timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub rx_timeout_ms: u32,
    /// Cool-down after three consecutive transport receive errors, in
    /// milliseconds.
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,
}

fn default_baud_rate() -> u32 {
    500_000
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u32 {
    1000
}

fn default_error_cooldown_ms() -> u64 {
    500
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            listen_only: false,
            loopback: false,
            extended_frames: default_true(),
            tx_timeout_ms: default_timeout_ms(),
            rx_timeout_ms: default_timeout_ms(),
            error_cooldown_ms: default_error_cooldown_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rates_are_valid() {
        for rate in STANDARD_BAUD_RATES {
            assert!(is_valid_baud_rate(*rate));
        }
        assert!(!is_valid_baud_rate(33_333));
        assert!(!is_valid_baud_rate(0));
    }
}
