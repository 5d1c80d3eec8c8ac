//! OBD-II client errors

use thiserror::Error;

use opendiag_can::ExchangeError;

#[derive(Debug, Error, Clone)]
pub enum ObdError {
    #[error("Negative response 0x{code:02X} for mode 0x{mode:02X}")]
    NegativeResponse { mode: u8, code: u8 },

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

    #[error("Monitoring already active")]
    MonitoringActive,
}

impl From<ExchangeError> for ObdError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Timeout => Self::Timeout,
            ExchangeError::Transport(msg) => Self::Transport(msg),
            ExchangeError::Cancelled => Self::Cancelled,
        }
    }
}
