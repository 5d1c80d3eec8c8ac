//! CAN frame and identifier types

use std::fmt;
use std::time::Instant;

use thiserror::Error;

/// Maximum payload of a classic CAN 2.0 data frame.
pub const MAX_FRAME_LEN: usize = 8;

/// Maximum length of an ISO-TP reassembled message a transport may deliver.
pub const MAX_SEGMENTED_LEN: usize = 4095;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("standard CAN id 0x{0:X} exceeds 11 bits")]
    StandardIdOutOfRange(u32),

    #[error("extended CAN id 0x{0:X} exceeds 29 bits")]
    ExtendedIdOutOfRange(u32),

    #[error("payload of {0} bytes exceeds the 8 byte CAN limit")]
    PayloadTooLong(usize),
}

/// A CAN identifier.
///
/// Standard (11-bit) and extended (29-bit) identifiers are distinct kinds;
/// a filter or awaiter registered for one kind never matches the other,
/// even when the raw values coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanId {
    /// Standard frame format, 11-bit identifier (0x000..=0x7FF)
    Standard(u16),
    /// Extended frame format, 29-bit identifier (0x00000000..=0x1FFFFFFF)
    Extended(u32),
}

impl CanId {
    pub const MAX_STANDARD: u16 = 0x7FF;
    pub const MAX_EXTENDED: u32 = 0x1FFF_FFFF;

    /// Validate and build a standard 11-bit identifier.
    pub fn standard(raw: u16) -> Result<Self, FrameError> {
        if raw > Self::MAX_STANDARD {
            return Err(FrameError::StandardIdOutOfRange(u32::from(raw)));
        }
        Ok(Self::Standard(raw))
    }

    /// Validate and build an extended 29-bit identifier.
    pub fn extended(raw: u32) -> Result<Self, FrameError> {
        if raw > Self::MAX_EXTENDED {
            return Err(FrameError::ExtendedIdOutOfRange(raw));
        }
        Ok(Self::Extended(raw))
    }

    /// Build an identifier of the requested kind from a raw value.
    pub fn new(raw: u32, extended: bool) -> Result<Self, FrameError> {
        if extended {
            Self::extended(raw)
        } else if raw > u32::from(Self::MAX_STANDARD) {
            Err(FrameError::StandardIdOutOfRange(raw))
        } else {
            Self::standard(raw as u16)
        }
    }

    /// Raw identifier bits.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Standard(id) => u32::from(*id),
            Self::Extended(id) => *id,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Extended(_))
    }

    /// True when `other` is the same kind of identifier.
    pub fn same_kind(&self, other: &CanId) -> bool {
        self.is_extended() == other.is_extended()
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(id) => write!(f, "0x{id:03X}"),
            Self::Extended(id) => write!(f, "0x{id:08X}"),
        }
    }
}

/// A single CAN frame.
///
/// Outbound frames built through [`CanFrame::new`] enforce the classic
/// 8-byte payload limit. Inbound frames built by a transport through
/// [`CanFrame::received`] may carry an ISO-TP reassembled diagnostic
/// message (a PassThru ISO15765 channel hands those over whole) and are
/// capped at [`MAX_SEGMENTED_LEN`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: CanId,
    pub data: Vec<u8>,
    /// Remote transmission request; RTR frames carry no payload.
    pub rtr: bool,
    /// Monotonic receive timestamp. `None` on outgoing frames.
    pub timestamp: Option<Instant>,
}

impl CanFrame {
    /// Build an outbound data frame, validating the payload length.
    pub fn new(id: CanId, data: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let data = data.into();
        if data.len() > MAX_FRAME_LEN {
            return Err(FrameError::PayloadTooLong(data.len()));
        }
        Ok(Self {
            id,
            data,
            rtr: false,
            timestamp: None,
        })
    }

    /// Build an outbound remote transmission request.
    pub fn remote(id: CanId) -> Self {
        Self {
            id,
            data: Vec::new(),
            rtr: true,
            timestamp: None,
        }
    }

    /// Build an outbound diagnostic message for a segmented (ISO15765)
    /// channel. The transport is responsible for segmentation; payloads up
    /// to [`MAX_SEGMENTED_LEN`] are accepted.
    pub fn segmented(id: CanId, data: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let data = data.into();
        if data.len() > MAX_SEGMENTED_LEN {
            return Err(FrameError::PayloadTooLong(data.len()));
        }
        Ok(Self {
            id,
            data,
            rtr: false,
            timestamp: None,
        })
    }

    /// Build a received frame, stamped now.
    ///
    /// Accepts payloads beyond 8 bytes up to the ISO-TP maximum so that
    /// transports running a segmented channel can deliver reassembled
    /// messages.
    pub fn received(id: CanId, data: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let data = data.into();
        if data.len() > MAX_SEGMENTED_LEN {
            return Err(FrameError::PayloadTooLong(data.len()));
        }
        Ok(Self {
            id,
            data,
            rtr: false,
            timestamp: Some(Instant::now()),
        })
    }

    /// Re-check the invariants, for frames whose fields were edited in
    /// place. Segmented diagnostic messages are allowed; an RTR frame must
    /// carry no payload.
    pub fn is_valid(&self) -> bool {
        self.data.len() <= MAX_SEGMENTED_LEN && !(self.rtr && !self.data.is_empty())
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rtr {
            write!(f, "{} RTR", self.id)
        } else {
            write!(f, "{} [", self.id)?;
            for (i, b) in self.data.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{b:02X}")?;
            }
            f.write_str("]")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_id_range() {
        assert!(CanId::standard(0x7FF).is_ok());
        assert_eq!(
            CanId::standard(0x800),
            Err(FrameError::StandardIdOutOfRange(0x800))
        );
    }

    #[test]
    fn extended_id_range() {
        assert!(CanId::extended(0x1FFF_FFFF).is_ok());
        assert_eq!(
            CanId::extended(0x2000_0000),
            Err(FrameError::ExtendedIdOutOfRange(0x2000_0000))
        );
    }

    #[test]
    fn kinds_are_distinct() {
        let std_id = CanId::standard(0x123).unwrap();
        let ext_id = CanId::extended(0x123).unwrap();
        assert_ne!(std_id, ext_id);
        assert!(!std_id.same_kind(&ext_id));
    }

    #[test]
    fn payload_limit_enforced_outbound() {
        let id = CanId::standard(0x7E0).unwrap();
        assert!(CanFrame::new(id, vec![0u8; 8]).is_ok());
        assert_eq!(
            CanFrame::new(id, vec![0u8; 9]),
            Err(FrameError::PayloadTooLong(9))
        );
    }

    #[test]
    fn received_accepts_segmented_payloads() {
        let id = CanId::standard(0x7E8).unwrap();
        let frame = CanFrame::received(id, vec![0u8; 20]).unwrap();
        assert!(frame.timestamp.is_some());
        assert!(CanFrame::received(id, vec![0u8; 4096]).is_err());
    }

    #[test]
    fn display_formats_hex() {
        let id = CanId::standard(0x7E8).unwrap();
        let frame = CanFrame::new(id, vec![0x41, 0x0C]).unwrap();
        assert_eq!(frame.to_string(), "0x7E8 [41 0C]");
    }
}
