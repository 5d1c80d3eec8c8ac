//! Diagnostic session model

use serde::{Deserialize, Serialize};

/// UDS diagnostic session (service 0x10 sub-function).
///
/// The cached session is mutated only by a positive response to
/// DiagnosticSessionControl; unsolicited transitions (ECU reset, tester
/// present lapse) reset it to [`UdsSession::Default`] via
/// [`crate::UdsClient::notify_session_lost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UdsSession {
    /// Default session (0x01)
    #[default]
    Default,
    /// Programming session (0x02)
    Programming,
    /// Extended diagnostic session (0x03)
    ExtendedDiagnostic,
    /// Safety system diagnostic session (0x04)
    SafetySystem,
}

impl UdsSession {
    pub fn sub_function(&self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::ExtendedDiagnostic => 0x03,
            Self::SafetySystem => 0x04,
        }
    }

    pub fn from_sub_function(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Default),
            0x02 => Some(Self::Programming),
            0x03 => Some(Self::ExtendedDiagnostic),
            0x04 => Some(Self::SafetySystem),
            _ => None,
        }
    }
}

impl std::fmt::Display for UdsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Programming => "programming",
            Self::ExtendedDiagnostic => "extended",
            Self::SafetySystem => "safety_system",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_function_round_trip() {
        for session in [
            UdsSession::Default,
            UdsSession::Programming,
            UdsSession::ExtendedDiagnostic,
            UdsSession::SafetySystem,
        ] {
            assert_eq!(
                UdsSession::from_sub_function(session.sub_function()),
                Some(session)
            );
        }
        assert_eq!(UdsSession::from_sub_function(0x60), None);
    }
}
