// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Motorola S-Record reader.
//!
//! Validates line framing, the declared line terminator, and per-record
//! checksums, then hands back a sequence of `(address, bytes)` pairs for
//! `SegmentMerger` to coalesce. Every framing failure (invalid type,
//! inconsistent line endings, bad checksum, duplicate address, no data
//! records) surfaces as `Error::SRecordSyntax`: one error kind, not one
//! type per cause, with the message string carrying the distinction.

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{Error, Result};

fn syntax(msg: impl Into<String>) -> Error {
    Error::SRecordSyntax(msg.into())
}

fn parse_hex(s: &str, what: &str) -> Result<u32> {
    u32::from_str_radix(s, 16).map_err(|_| syntax(format!("invalid hex digits in {what}: {s:?}")))
}

fn parse_hex_byte(s: &str, what: &str) -> Result<u8> {
    u8::from_str_radix(s, 16).map_err(|_| syntax(format!("invalid hex digits in {what}: {s:?}")))
}

/// Split `content` into logical S-Record lines, enforcing a single
/// consistent line terminator inferred from the first line.
fn split_lines(content: &str) -> Result<Vec<&str>> {
    let term = if let Some(idx) = content.find(['\r', '\n']) {
        if content.as_bytes()[idx] == b'\r' && content.as_bytes().get(idx + 1) == Some(&b'\n') {
            "\r\n"
        } else if content.as_bytes()[idx] == b'\r' {
            "\r"
        } else {
            "\n"
        }
    } else {
        return Err(syntax("S-Record file contains no line terminator"));
    };

    let mut lines = Vec::new();
    let mut rest = content;
    while let Some(idx) = rest.find(term) {
        let line = &rest[..idx];
        if line.contains('\r') || line.contains('\n') {
            return Err(syntax("inconsistent line endings in S-Record file"));
        }
        lines.push(line);
        rest = &rest[idx + term.len()..];
    }
    if !rest.is_empty() {
        if rest.contains('\r') || rest.contains('\n') {
            return Err(syntax("inconsistent line endings in S-Record file"));
        }
        lines.push(rest);
    }
    Ok(lines)
}

/// Decode an `'S1'`/`'S2'` data record's payload (the line with the
/// leading `S` and type digit already stripped) into `(address, data)`.
fn decode_data_record(type_digit: char, payload: &str) -> Result<(u32, Vec<u8>)> {
    let addr_len = type_digit
        .to_digit(10)
        .ok_or_else(|| syntax(format!("invalid record type digit: {type_digit:?}")))? as usize
        + 1;
    if addr_len != 2 && addr_len != 3 {
        return Err(syntax(format!("unsupported address length: {addr_len}")));
    }

    if payload.len() < 2 {
        return Err(syntax("S-Record too short"));
    }
    let size = parse_hex_byte(&payload[0..2], "size field")? as usize;

    if payload.len() != 2 * size + 2 {
        return Err(syntax(format!(
            "S-Record length mismatch: size field says {size}, line has {} hex digits",
            (payload.len() - 2) / 2
        )));
    }

    if size < addr_len + 1 {
        return Err(syntax("S-Record size field too small for its address length"));
    }

    let addr_start = 2;
    let addr_end = addr_start + 2 * addr_len;
    let address = parse_hex(&payload[addr_start..addr_end], "address field")?;

    let data_hex_len = 2 * (size - addr_len - 1);
    let data_start = addr_end;
    let data_end = data_start + data_hex_len;
    let mut data = Vec::with_capacity(data_hex_len / 2);
    for chunk_start in (data_start..data_end).step_by(2) {
        data.push(parse_hex_byte(&payload[chunk_start..chunk_start + 2], "data field")?);
    }

    let csum_str = &payload[data_end..data_end + 2];
    let checksum = parse_hex_byte(csum_str, "checksum field")?;

    let mut addr_bytes_sum: u32 = 0;
    for chunk_start in (addr_start..addr_end).step_by(2) {
        addr_bytes_sum += parse_hex_byte(&payload[chunk_start..chunk_start + 2], "address field")? as u32;
    }
    let data_sum: u32 = data.iter().map(|&b| b as u32).sum();
    let computed = !((size as u32 + addr_bytes_sum + data_sum) as u8) & 0xFF;

    if computed != checksum {
        return Err(syntax(format!(
            "checksum mismatch at address 0x{address:04x}: computed 0x{computed:02x}, found 0x{checksum:02x}"
        )));
    }

    Ok((address, data))
}

/// Parse a complete S-Record stream into the raw, pre-merge records: a
/// map from start address to decoded bytes, erroring on a duplicate
/// start address.
pub fn parse(mut reader: impl Read) -> Result<BTreeMap<u32, Vec<u8>>> {
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(Error::Io)?;

    let lines = split_lines(&content)?;

    let mut records: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut non_empty_lines = 0u32;
    for (line_index, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        let is_first_non_empty = non_empty_lines == 0;
        non_empty_lines += 1;

        if !line.starts_with('S') {
            return Err(syntax(format!("line {} does not start with 'S'", line_index + 1)));
        }
        let type_char = line
            .chars()
            .nth(1)
            .ok_or_else(|| syntax(format!("line {} missing record type", line_index + 1)))?;

        match type_char {
            '0' => {
                if !is_first_non_empty {
                    return Err(syntax("S0 header record must be the first non-empty line"));
                }
            }
            '1' | '2' => {
                let (address, data) = decode_data_record(type_char, &line[2..])?;
                if records.insert(address, data).is_some() {
                    return Err(syntax(format!(
                        "duplicate start address 0x{address:04x} in S-Record file"
                    )));
                }
            }
            '8' | '9' => {
                // Terminator record; accepted silently.
            }
            other => {
                return Err(syntax(format!("invalid record type: 'S{other}'")));
            }
        }
    }

    if records.is_empty() {
        return Err(syntax("S-Record file contained no data records"));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a well-formed `S1` line for the given address/data and its
    /// correct checksum, so tests aren't stuck hand-computing hex by hand.
    fn s1_line(addr: u16, data: &[u8]) -> String {
        let size = 2 + data.len() + 1;
        let addr_bytes = addr.to_be_bytes();
        let sum: u32 = size as u32
            + addr_bytes.iter().map(|&b| b as u32).sum::<u32>()
            + data.iter().map(|&b| b as u32).sum::<u32>();
        let csum = !(sum as u8) & 0xFF;
        let data_hex: String = data.iter().map(|b| format!("{b:02X}")).collect();
        format!("S1{size:02X}{addr:04X}{data_hex}{csum:02X}")
    }

    #[test]
    fn parses_single_record() {
        // Mirrors the address/size/data shape of the worked example: a
        // 2-byte-address record at 0x7AF0 carrying 16 data bytes.
        let data: Vec<u8> = (0x0Au8..=0x19u8).collect();
        let line = format!("{}\r\n", s1_line(0x7AF0, &data));
        let records = parse(line.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[&0x7AF0], &data);
    }

    #[test]
    fn three_byte_address_record() {
        // S2, addr_len=3: size=0x14 (20), addr 012005 (3 bytes), 16 data bytes.
        let addr = "012005";
        let data_bytes: Vec<u8> = (0u8..16).collect();
        let data_hex: String = data_bytes.iter().map(|b| format!("{b:02x}")).collect();
        let size = 1 + 3 + data_bytes.len();
        let mut sum = size as u32;
        for b in [0x01u8, 0x20, 0x05] {
            sum += b as u32;
        }
        for b in &data_bytes {
            sum += *b as u32;
        }
        let csum = !(sum as u8) & 0xFF;
        let line = format!("S2{size:02x}{addr}{data_hex}{csum:02x}\n");
        let records = parse(line.as_bytes()).unwrap();
        assert_eq!(records[&0x012005], data_bytes);
    }

    #[test]
    fn header_only_allowed_first() {
        let data: Vec<u8> = (0x0Au8..=0x19u8).collect();
        let input = format!("{}\r\nS0030000FC\r\n", s1_line(0x7AF0, &data));
        assert!(parse(input.as_bytes()).is_err());
    }

    #[test]
    fn header_allowed_after_leading_blank_line() {
        // A leading blank line shifts the header to line index 1, but it's
        // still the first *non-empty* line, so it must still be accepted.
        let data: Vec<u8> = (0x0Au8..=0x19u8).collect();
        let input = format!("\r\nS0030000FC\r\n{}\r\n", s1_line(0x7AF0, &data));
        assert!(parse(input.as_bytes()).is_ok());
    }

    #[test]
    fn rejects_bad_checksum() {
        let data: Vec<u8> = (0x0Au8..=0x19u8).collect();
        let mut line = s1_line(0x7AF0, &data);
        // Flip the last (checksum) byte so it no longer matches.
        line.truncate(line.len() - 2);
        line.push_str("FF");
        let input = format!("{line}\r\n");
        let err = parse(input.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::SRecordSyntax(_)));
    }

    #[test]
    fn rejects_inconsistent_line_endings() {
        let data: Vec<u8> = (0x0Au8..=0x19u8).collect();
        let input = format!("{}\r\nS9030000FC\n", s1_line(0x7AF0, &data));
        let err = parse(input.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::SRecordSyntax(_)));
    }

    #[test]
    fn rejects_duplicate_address() {
        let data: Vec<u8> = (0x0Au8..=0x19u8).collect();
        let line = s1_line(0x7AF0, &data);
        let input = format!("{line}\r\n{line}\r\n");
        let err = parse(input.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::SRecordSyntax(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        let data: Vec<u8> = (0x0Au8..=0x19u8).collect();
        let input = format!("{}\r\nS3030000FC\r\n", s1_line(0x7AF0, &data));
        assert!(parse(input.as_bytes()).is_err());
    }

    #[test]
    fn rejects_no_data() {
        let input = "S0030000FC\r\nS9030000FC\r\n";
        assert!(parse(input.as_bytes()).is_err());
    }
}
