//! Intel HEX parsing and encoding
//!
//! Record layout after the `:` marker, as hex pairs: byte count, 16-bit
//! address, record type, data, checksum. The sum of every record byte
//! including the stored checksum is zero modulo 256.
//!
//! Honored record types: 00 (data), 01 (end of file), 04 (extended linear
//! address, contributing the upper 16 address bits). Everything else is
//! ignored silently.

use std::fmt::Write as _;

use crate::error::ParseError;
use crate::file::{BlockAccumulator, FlashBlock};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_LINEAR: u8 = 0x04;

/// Parse an Intel HEX image into blocks.
pub fn parse(input: &[u8]) -> Result<Vec<FlashBlock>, ParseError> {
    let text =
        std::str::from_utf8(input).map_err(|_| ParseError::new("input is not valid text"))?;

    let mut acc = BlockAccumulator::new();
    let mut base: u32 = 0;

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        let Some(body) = line.strip_prefix(':') else {
            // Lines without the record marker are skipped.
            continue;
        };

        let bytes = decode_hex(body, line_no)?;
        if bytes.len() < 5 {
            return Err(ParseError::at(line_no, "record shorter than the fixed fields"));
        }

        let count = usize::from(bytes[0]);
        if bytes.len() != count + 5 {
            return Err(ParseError::at(
                line_no,
                format!("record length {} does not match byte count {count}", bytes.len() - 5),
            ));
        }

        let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(ParseError::at(line_no, "record checksum mismatch"));
        }

        let address = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = bytes[3];
        let payload = &bytes[4..4 + count];

        match record_type {
            RECORD_DATA => acc.push(base | u32::from(address), payload),
            RECORD_EOF => return Ok(acc.finish()),
            RECORD_EXT_LINEAR => {
                if count == 2 {
                    base = u32::from(u16::from_be_bytes([payload[0], payload[1]])) << 16;
                }
            }
            // Types 02, 03, 05 and friends carry segment bases and start
            // addresses this loader does not use.
            _ => {}
        }
    }

    Ok(acc.finish())
}

/// Encode blocks back to Intel HEX with 16-byte data records.
pub fn encode(blocks: &[FlashBlock]) -> String {
    let mut out = String::new();
    let mut base: u32 = 0;

    for block in blocks {
        let mut address = block.address;
        let mut remaining = block.data.as_slice();

        while !remaining.is_empty() {
            let upper = address >> 16;
            if upper != base {
                push_record(&mut out, RECORD_EXT_LINEAR, 0, &(upper as u16).to_be_bytes());
                base = upper;
            }

            // Keep each record inside its 64 KiB page.
            let offset = address & 0xFFFF;
            let room = (0x1_0000 - offset) as usize;
            let take = remaining.len().min(16).min(room);
            let (chunk, rest) = remaining.split_at(take);

            push_record(&mut out, RECORD_DATA, offset as u16, chunk);
            address += take as u32;
            remaining = rest;
        }
    }

    push_record(&mut out, RECORD_EOF, 0, &[]);
    out
}

fn push_record(out: &mut String, record_type: u8, address: u16, payload: &[u8]) {
    let mut sum = (payload.len() as u8)
        .wrapping_add((address >> 8) as u8)
        .wrapping_add(address as u8)
        .wrapping_add(record_type);
    for b in payload {
        sum = sum.wrapping_add(*b);
    }
    let checksum = sum.wrapping_neg();

    let _ = write!(out, ":{:02X}{address:04X}{record_type:02X}", payload.len());
    for b in payload {
        let _ = write!(out, "{b:02X}");
    }
    let _ = writeln!(out, "{checksum:02X}");
}

fn decode_hex(body: &str, line_no: usize) -> Result<Vec<u8>, ParseError> {
    if body.len() % 2 != 0 {
        return Err(ParseError::at(line_no, "odd number of hex digits"));
    }
    hex::decode(body).map_err(|_| ParseError::at(line_no, "invalid hex digits"))
}
