//! PID constants and value decoding
//!
//! Mode 0x01 parameter identifiers with their fixed decode formulas. Raw
//! bytes are indexed A, B, ... as received after the mode and PID echo.

use serde::Serialize;

/// Commonly used mode 0x01 PIDs.
pub mod well_known {
    /// Bit-map of supported PIDs 0x01-0x20
    pub const SUPPORTED_01_20: u8 = 0x00;
    pub const ENGINE_LOAD: u8 = 0x04;
    pub const COOLANT_TEMP: u8 = 0x05;
    pub const FUEL_PRESSURE: u8 = 0x0A;
    pub const INTAKE_MAP: u8 = 0x0B;
    pub const ENGINE_RPM: u8 = 0x0C;
    pub const VEHICLE_SPEED: u8 = 0x0D;
    pub const TIMING_ADVANCE: u8 = 0x0E;
    pub const INTAKE_AIR_TEMP: u8 = 0x0F;
    pub const MAF_RATE: u8 = 0x10;
    pub const THROTTLE_POSITION: u8 = 0x11;
    pub const RUNTIME: u8 = 0x1F;
    /// Bit-map of supported PIDs 0x21-0x40
    pub const SUPPORTED_21_40: u8 = 0x20;
    pub const DISTANCE_WITH_MIL: u8 = 0x21;
    pub const FUEL_TANK_LEVEL: u8 = 0x2F;
    pub const DISTANCE_SINCE_CLEAR: u8 = 0x31;
    pub const BARO_PRESSURE: u8 = 0x33;
    /// VIN InfoType for mode 0x09
    pub const INFO_VIN: u8 = 0x02;
}

/// A decoded live-data parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ObdParameter {
    pub pid: u8,
    /// Response bytes after the mode and PID echo
    pub raw: Vec<u8>,
    pub value: f64,
    pub unit: String,
    pub description: String,
}

impl ObdParameter {
    /// Decode `raw` for `pid` using the fixed per-PID formula. Unknown
    /// PIDs decode to their first byte with unit `"raw"`.
    pub fn decode(pid: u8, raw: Vec<u8>) -> Self {
        let (value, unit) = decode_value(pid, &raw);
        Self {
            pid,
            raw,
            value,
            unit: unit.to_string(),
            description: description(pid).to_string(),
        }
    }

    /// `"1726.00 RPM"`-style rendering.
    pub fn formatted(&self) -> String {
        if self.unit.is_empty() {
            format!("{:.2}", self.value)
        } else {
            format!("{:.2} {}", self.value, self.unit)
        }
    }
}

fn byte(raw: &[u8], index: usize) -> f64 {
    raw.get(index).copied().map(f64::from).unwrap_or(0.0)
}

fn word(raw: &[u8]) -> f64 {
    256.0 * byte(raw, 0) + byte(raw, 1)
}

/// The fixed decode formula for a PID.
pub fn decode_value(pid: u8, raw: &[u8]) -> (f64, &'static str) {
    use well_known::*;

    if raw.is_empty() {
        return (0.0, "raw");
    }

    match pid {
        ENGINE_LOAD | THROTTLE_POSITION | FUEL_TANK_LEVEL => (byte(raw, 0) * 100.0 / 255.0, "%"),
        COOLANT_TEMP | INTAKE_AIR_TEMP => (byte(raw, 0) - 40.0, "°C"),
        FUEL_PRESSURE => (byte(raw, 0) * 3.0, "kPa"),
        INTAKE_MAP | BARO_PRESSURE => (byte(raw, 0), "kPa"),
        ENGINE_RPM => (word(raw) / 4.0, "RPM"),
        VEHICLE_SPEED => (byte(raw, 0), "km/h"),
        TIMING_ADVANCE => (byte(raw, 0) / 2.0 - 64.0, "°"),
        MAF_RATE => (word(raw) / 100.0, "g/s"),
        RUNTIME => (word(raw), "s"),
        DISTANCE_WITH_MIL | DISTANCE_SINCE_CLEAR => (word(raw), "km"),
        _ => (byte(raw, 0), "raw"),
    }
}

/// Human-readable name for a PID.
pub fn description(pid: u8) -> &'static str {
    use well_known::*;
    match pid {
        ENGINE_LOAD => "Engine Load",
        COOLANT_TEMP => "Coolant Temperature",
        FUEL_PRESSURE => "Fuel Pressure",
        INTAKE_MAP => "Intake Manifold Pressure",
        ENGINE_RPM => "Engine RPM",
        VEHICLE_SPEED => "Vehicle Speed",
        TIMING_ADVANCE => "Timing Advance",
        INTAKE_AIR_TEMP => "Intake Air Temperature",
        MAF_RATE => "MAF Air Flow Rate",
        THROTTLE_POSITION => "Throttle Position",
        RUNTIME => "Runtime Since Engine Start",
        DISTANCE_WITH_MIL => "Distance with MIL On",
        FUEL_TANK_LEVEL => "Fuel Tank Level",
        DISTANCE_SINCE_CLEAR => "Distance Since Codes Cleared",
        BARO_PRESSURE => "Barometric Pressure",
        _ => "Unknown Parameter",
    }
}

/// Walk a 4-byte supported-PID bit-map. Bit `i` (MSB first) set means PID
/// `base + i + 1` is supported.
pub fn parse_supported_bitmap(data: &[u8], base: u8) -> Vec<u8> {
    let mut pids = Vec::new();
    if data.len() != 4 {
        return pids;
    }

    for (byte_index, value) in data.iter().enumerate() {
        for bit in 0..8 {
            if value & (1 << (7 - bit)) != 0 {
                pids.push(base + (byte_index as u8) * 8 + bit + 1);
            }
        }
    }
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_formula() {
        let param = ObdParameter::decode(well_known::ENGINE_RPM, vec![0x1A, 0xF8]);
        assert_eq!(param.value, 1726.0);
        assert_eq!(param.unit, "RPM");
        assert_eq!(param.formatted(), "1726.00 RPM");
    }

    #[test]
    fn temperature_offset() {
        let param = ObdParameter::decode(well_known::COOLANT_TEMP, vec![90]);
        assert_eq!(param.value, 50.0);
        assert_eq!(param.unit, "°C");
    }

    #[test]
    fn percent_scaling() {
        let param = ObdParameter::decode(well_known::THROTTLE_POSITION, vec![255]);
        assert_eq!(param.value, 100.0);
        assert_eq!(param.unit, "%");
    }

    #[test]
    fn timing_advance_is_signed() {
        let param = ObdParameter::decode(well_known::TIMING_ADVANCE, vec![100]);
        assert_eq!(param.value, -14.0);
    }

    #[test]
    fn maf_division() {
        let param = ObdParameter::decode(well_known::MAF_RATE, vec![0x01, 0x2C]);
        assert_eq!(param.value, 3.0);
        assert_eq!(param.unit, "g/s");
    }

    #[test]
    fn unknown_pid_decodes_raw() {
        let param = ObdParameter::decode(0x7D, vec![0x42, 0x01]);
        assert_eq!(param.value, 66.0);
        assert_eq!(param.unit, "raw");
        assert_eq!(param.description, "Unknown Parameter");
    }

    #[test]
    fn supported_bitmap_walk() {
        // MSB of the first byte = PID base+1; LSB of the last = base+32.
        let pids = parse_supported_bitmap(&[0x80, 0x00, 0x00, 0x01], 0);
        assert_eq!(pids, vec![0x01, 0x20]);

        let pids = parse_supported_bitmap(&[0xBE, 0x3F, 0xB8, 0x13], 0);
        assert!(pids.contains(&0x01));
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x20));
        assert!(!pids.contains(&0x02));
    }

    #[test]
    fn bitmap_requires_four_bytes() {
        assert!(parse_supported_bitmap(&[0xFF], 0).is_empty());
    }
}
