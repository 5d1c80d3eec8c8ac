//! opendiag-flash - flash file handling and ECU reprogramming
//!
//! Parses Intel HEX, Motorola S-Record and raw binary images into
//! address-tagged blocks, then drives the UDS download services
//! (0x34 / 0x36 / 0x37) through a staged programming run with optional
//! erase and read-back verification.

pub mod error;
pub mod file;
pub mod ihex;
pub mod manager;
pub mod srec;

pub use error::{FlashError, ParseError};
pub use file::{FlashBlock, FlashFile, FlashFileFormat, FlashRegion};
pub use manager::{FlashConfig, FlashManager, FlashState, FlashStatistics, ProgressCallback};
