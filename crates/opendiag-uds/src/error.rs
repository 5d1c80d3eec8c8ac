//! UDS protocol errors

use thiserror::Error;

use opendiag_can::ExchangeError;

use super::NegativeResponseCode;

#[derive(Debug, Error, Clone)]
pub enum UdsError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    /// NRC 0x33/0x35/0x36/0x37, split out so secure-session and flash
    /// flows can react without matching raw code values.
    #[error("Security access denied: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    SecurityDenied {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<ExchangeError> for UdsError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Timeout => Self::Timeout,
            ExchangeError::Transport(msg) => Self::Transport(msg),
            ExchangeError::Cancelled => Self::Cancelled,
        }
    }
}

impl UdsError {
    /// Build the error for a decoded negative response, routing security
    /// refusals to their own variant.
    pub(crate) fn from_negative(service_id: u8, nrc: NegativeResponseCode) -> Self {
        if nrc.is_security_denial() {
            Self::SecurityDenied { service_id, nrc }
        } else {
            Self::NegativeResponse { service_id, nrc }
        }
    }
}
