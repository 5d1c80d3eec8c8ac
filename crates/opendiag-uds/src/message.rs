//! UDS message model and byte layout
//!
//! On the wire a request starts with its service identifier, a positive
//! response with the service identifier plus 0x40, and a negative response
//! with 0x7F followed by the original service identifier and the NRC.

use std::fmt;

use crate::nrc::NegativeResponseCode;
use crate::{service_id, POSITIVE_RESPONSE_OFFSET};

/// What a [`UdsMessage`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdsMessageKind {
    Request,
    PositiveResponse,
    NegativeResponse(NegativeResponseCode),
}

/// A decoded UDS message: service identifier, body, and direction tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsMessage {
    pub service: u8,
    pub data: Vec<u8>,
    pub kind: UdsMessageKind,
}

impl UdsMessage {
    pub fn request(service: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            service,
            data: data.into(),
            kind: UdsMessageKind::Request,
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self.kind, UdsMessageKind::NegativeResponse(_))
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self.kind {
            UdsMessageKind::Request => {
                let mut out = Vec::with_capacity(self.data.len() + 1);
                out.push(self.service);
                out.extend_from_slice(&self.data);
                out
            }
            UdsMessageKind::PositiveResponse => {
                let mut out = Vec::with_capacity(self.data.len() + 1);
                out.push(self.service.wrapping_add(POSITIVE_RESPONSE_OFFSET));
                out.extend_from_slice(&self.data);
                out
            }
            UdsMessageKind::NegativeResponse(nrc) => {
                vec![service_id::NEGATIVE_RESPONSE, self.service, nrc.into()]
            }
        }
    }

    /// Decode a received payload (response direction).
    ///
    /// Returns `None` for an empty payload or a truncated negative
    /// response.
    pub fn decode_response(payload: &[u8]) -> Option<Self> {
        let (&first, rest) = payload.split_first()?;

        if first == service_id::NEGATIVE_RESPONSE {
            if rest.len() < 2 {
                return None;
            }
            return Some(Self {
                service: rest[0],
                data: rest[2..].to_vec(),
                kind: UdsMessageKind::NegativeResponse(NegativeResponseCode::from(rest[1])),
            });
        }

        if first >= POSITIVE_RESPONSE_OFFSET {
            return Some(Self {
                service: first.wrapping_sub(POSITIVE_RESPONSE_OFFSET),
                data: rest.to_vec(),
                kind: UdsMessageKind::PositiveResponse,
            });
        }

        Some(Self {
            service: first,
            data: rest.to_vec(),
            kind: UdsMessageKind::Request,
        })
    }
}

impl fmt::Display for UdsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            UdsMessageKind::Request => {
                write!(f, "REQ 0x{:02X} [{}]", self.service, hex::encode(&self.data))
            }
            UdsMessageKind::PositiveResponse => {
                write!(f, "RSP 0x{:02X} [{}]", self.service, hex::encode(&self.data))
            }
            UdsMessageKind::NegativeResponse(nrc) => {
                write!(f, "NRC {} for 0x{:02X}", nrc, self.service)
            }
        }
    }
}
