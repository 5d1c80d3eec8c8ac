//! DTC (Diagnostic Trouble Code) handling for UDS service 0x19
//!
//! Types and parsers for ISO 14229-1 DTC records: a 24-bit trouble code
//! plus a status byte, four bytes per record on the wire.

use serde::Serialize;

/// Sub-function codes for ReadDTCInformation (0x19)
pub mod sub_function {
    /// Report number of DTCs matching a status mask
    pub const REPORT_NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    /// Report DTCs matching a status mask
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
    /// Report supported DTCs
    pub const REPORT_SUPPORTED_DTC: u8 = 0x0A;
}

/// DTC group addresses for ClearDiagnosticInformation (0x14)
pub mod dtc_group {
    /// All DTC groups (clear all)
    pub const ALL: u32 = 0xFFFFFF;
    /// Powertrain group (P codes)
    pub const POWERTRAIN: u32 = 0x000000;
    /// Chassis group (C codes)
    pub const CHASSIS: u32 = 0x400000;
    /// Body group (B codes)
    pub const BODY: u32 = 0x800000;
    /// Network group (U codes)
    pub const NETWORK: u32 = 0xC00000;
}

/// DTC status byte bit definitions per ISO 14229-1
pub mod status_bit {
    /// Bit 0: Test failed this operation cycle
    pub const TEST_FAILED: u8 = 0x01;
    /// Bit 2: Pending - failed but not yet confirmed
    pub const PENDING_DTC: u8 = 0x04;
    /// Bit 3: Confirmed - malfunction confirmed and stored
    pub const CONFIRMED_DTC: u8 = 0x08;
    /// Bit 7: Warning indicator requested
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;
}

/// Parsed DTC status byte
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DtcStatus {
    /// Bit 0: test failed at time of request
    pub active: bool,
    /// Bit 2: pending (failed but not yet confirmed)
    pub pending: bool,
    /// Bit 3: confirmed (malfunction stored)
    pub confirmed: bool,
    /// Bit 7: warning indicator (MIL) requested
    pub warning_indicator: bool,
    /// Raw status byte value
    pub raw: u8,
}

impl DtcStatus {
    pub fn from_byte(status: u8) -> Self {
        Self {
            active: (status & status_bit::TEST_FAILED) != 0,
            pending: (status & status_bit::PENDING_DTC) != 0,
            confirmed: (status & status_bit::CONFIRMED_DTC) != 0,
            warning_indicator: (status & status_bit::WARNING_INDICATOR_REQUESTED) != 0,
            raw: status,
        }
    }

    pub fn matches_mask(&self, mask: u8) -> bool {
        (self.raw & mask) != 0
    }
}

/// A parsed UDS DTC: 24-bit code plus status.
#[derive(Debug, Clone, Serialize)]
pub struct Dtc {
    /// 3-byte DTC number (high, mid, low)
    pub number: [u8; 3],
    /// Status byte, decoded
    pub status: DtcStatus,
}

impl Dtc {
    pub fn new(high: u8, mid: u8, low: u8, status: u8) -> Self {
        Self {
            number: [high, mid, low],
            status: DtcStatus::from_byte(status),
        }
    }

    /// The 24-bit DTC number as a u32.
    pub fn number_u32(&self) -> u32 {
        (u32::from(self.number[0]) << 16) | (u32::from(self.number[1]) << 8) | u32::from(self.number[2])
    }

    /// Hex identifier (e.g. `012345`) for logs and lookups.
    pub fn to_id(&self) -> String {
        hex::encode_upper(self.number)
    }
}

/// Result of reading a DTC count (0x19 / 0x01).
#[derive(Debug, Clone)]
pub struct DtcCount {
    /// Which status bits the ECU supports
    pub status_availability_mask: u8,
    /// DTC format identifier (0x01 for ISO 14229-1)
    pub format_identifier: u8,
    /// Number of DTCs matching the requested mask
    pub count: u16,
}

/// Parse a `59 01` (reportNumberOfDTCByStatusMask) response body.
pub fn parse_dtc_count(response: &[u8]) -> Result<DtcCount, String> {
    // 0x59 0x01 [availabilityMask] [formatIdentifier] [count_hi] [count_lo]
    if response.len() < 6 {
        return Err(format!("DTC count response too short: {} bytes", response.len()));
    }
    if response[0] != 0x59 || response[1] != sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK {
        return Err(format!(
            "unexpected DTC count header: 0x{:02X} 0x{:02X}",
            response[0], response[1]
        ));
    }

    Ok(DtcCount {
        status_availability_mask: response[2],
        format_identifier: response[3],
        count: u16::from_be_bytes([response[4], response[5]]),
    })
}

/// Parse a `59 02` (reportDTCByStatusMask) response body into records.
///
/// Records are four bytes each; a trailing partial record is ignored.
pub fn parse_dtc_records(response: &[u8]) -> Result<(u8, Vec<Dtc>), String> {
    // 0x59 0x02 [availabilityMask] { [hi] [mid] [lo] [status] }*
    if response.len() < 3 {
        return Err(format!("DTC response too short: {} bytes", response.len()));
    }
    if response[0] != 0x59 || response[1] != sub_function::REPORT_DTC_BY_STATUS_MASK {
        return Err(format!(
            "unexpected DTC header: 0x{:02X} 0x{:02X}",
            response[0], response[1]
        ));
    }

    let availability = response[2];
    let mut dtcs = Vec::new();
    for chunk in response[3..].chunks_exact(4) {
        dtcs.push(Dtc::new(chunk[0], chunk[1], chunk[2], chunk[3]));
    }

    Ok((availability, dtcs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bits() {
        let status = DtcStatus::from_byte(0x09);
        assert!(status.active);
        assert!(status.confirmed);
        assert!(!status.pending);
        assert!(status.matches_mask(0x08));

        let pending = DtcStatus::from_byte(0x04);
        assert!(pending.pending);
        assert!(!pending.active);
    }

    #[test]
    fn dtc_number_and_id() {
        let dtc = Dtc::new(0x01, 0x23, 0x45, 0x09);
        assert_eq!(dtc.number_u32(), 0x012345);
        assert_eq!(dtc.to_id(), "012345");
    }

    #[test]
    fn parse_count_response() {
        let response = [0x59, 0x01, 0xFF, 0x01, 0x00, 0x05];
        let count = parse_dtc_count(&response).unwrap();
        assert_eq!(count.status_availability_mask, 0xFF);
        assert_eq!(count.format_identifier, 0x01);
        assert_eq!(count.count, 5);
    }

    #[test]
    fn parse_records_response() {
        let response = [
            0x59, 0x02, 0xFF, // header + availability mask
            0x01, 0x23, 0x45, 0x09, // DTC 0x012345, active+confirmed
            0x06, 0x78, 0x90, 0x04, // DTC 0x067890, pending
        ];
        let (mask, dtcs) = parse_dtc_records(&response).unwrap();
        assert_eq!(mask, 0xFF);
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].number_u32(), 0x012345);
        assert!(dtcs[0].status.active);
        assert_eq!(dtcs[1].number_u32(), 0x067890);
        assert!(dtcs[1].status.pending);
    }

    #[test]
    fn partial_trailing_record_ignored() {
        let response = [0x59, 0x02, 0xFF, 0x01, 0x23];
        let (_, dtcs) = parse_dtc_records(&response).unwrap();
        assert!(dtcs.is_empty());
    }
}
