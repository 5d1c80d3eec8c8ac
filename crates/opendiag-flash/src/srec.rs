//! Motorola S-Record parsing
//!
//! Data records S1/S2/S3 carry 16/24/32-bit addresses. The count byte
//! covers the address, data and checksum; the checksum is the one's
//! complement of the sum of count, address and data bytes. S0 (header),
//! S5/S6 (record counts) and S7/S8/S9 (start addresses) are skipped.

use crate::error::ParseError;
use crate::file::{BlockAccumulator, FlashBlock};

/// Parse an S-Record image into blocks.
pub fn parse(input: &[u8]) -> Result<Vec<FlashBlock>, ParseError> {
    let text =
        std::str::from_utf8(input).map_err(|_| ParseError::new("input is not valid text"))?;

    let mut acc = BlockAccumulator::new();

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        let Some(body) = line.strip_prefix('S') else {
            continue;
        };
        let Some(record_type) = body.chars().next() else {
            continue;
        };

        let address_bytes = match record_type {
            '1' => 2usize,
            '2' => 3,
            '3' => 4,
            // Header, count and termination records carry no image data.
            '0' | '5' | '6' | '7' | '8' | '9' => continue,
            other => {
                return Err(ParseError::at(line_no, format!("unknown record type S{other}")));
            }
        };

        let bytes = decode_hex(&body[1..], line_no)?;
        if bytes.is_empty() {
            return Err(ParseError::at(line_no, "record missing byte count"));
        }

        let count = usize::from(bytes[0]);
        if bytes.len() != count + 1 {
            return Err(ParseError::at(
                line_no,
                format!("record length {} does not match byte count {count}", bytes.len() - 1),
            ));
        }
        if count < address_bytes + 1 {
            return Err(ParseError::at(line_no, "record shorter than its address field"));
        }

        // One's complement of the sum of count, address and data bytes.
        let sum: u8 = bytes[..bytes.len() - 1]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        if !sum != bytes[bytes.len() - 1] {
            return Err(ParseError::at(line_no, "record checksum mismatch"));
        }

        let mut address: u32 = 0;
        for &b in &bytes[1..1 + address_bytes] {
            address = (address << 8) | u32::from(b);
        }
        let payload = &bytes[1 + address_bytes..bytes.len() - 1];
        acc.push(address, payload);
    }

    Ok(acc.finish())
}

fn decode_hex(body: &str, line_no: usize) -> Result<Vec<u8>, ParseError> {
    if body.len() % 2 != 0 {
        return Err(ParseError::at(line_no, "odd number of hex digits"));
    }
    hex::decode(body).map_err(|_| ParseError::at(line_no, "invalid hex digits"))
}
