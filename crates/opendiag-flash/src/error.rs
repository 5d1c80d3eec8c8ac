//! Flash errors

use thiserror::Error;

use opendiag_uds::UdsError;

/// Flash file parse failure, with the 1-based source line where known.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("parse error{}: {message}", .line.map(|l| format!(" at line {l}")).unwrap_or_default())]
pub struct ParseError {
    pub line: Option<usize>,
    pub message: String,
}

impl ParseError {
    pub fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("failed to load flash file: {0}")]
    FileLoad(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("flash file failed validation: {0}")]
    InvalidFile(String),

    #[error("failed to enter programming session: {0}")]
    BootloaderEntry(#[source] UdsError),

    #[error("security access denied: {0}")]
    SecurityDenied(#[source] UdsError),

    #[error("erase failed for region at 0x{address:08X}: {source}")]
    Erase {
        address: u32,
        #[source]
        source: UdsError,
    },

    #[error("programming failed at 0x{address:08X}: {source}")]
    Programming {
        address: u32,
        #[source]
        source: UdsError,
    },

    #[error("verification mismatch at 0x{address:08X}")]
    VerificationMismatch { address: u32 },

    #[error("verification read failed at 0x{address:08X}: {source}")]
    VerificationRead {
        address: u32,
        #[source]
        source: UdsError,
    },

    #[error("address 0x{0:08X} is outside every configured region")]
    InvalidAddress(u32),

    #[error("region at 0x{0:08X} is write-protected")]
    RegionProtected(u32),

    #[error("flash manager is busy")]
    Busy,
}
