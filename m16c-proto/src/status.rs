// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoder for the M16C boot-ROM's 16-bit status register.
//!
//! The register is read little-endian off the wire and packs readiness,
//! flash-operation result, id-validation state, and a checksum-ok flag
//! into a handful of bit fields. `StatusWord` is a pure, stateless
//! decoder over that value: it owns no I/O and is trivially testable.

use std::fmt;

const READY_BIT: u16 = 0x0080;
const FLASH_ERROR_MASK: u16 = 0x0038;
const ID_VALID_MASK: u16 = 0x0C00;
const CHECK_OK_BIT: u16 = 0x2000;

/// One of the flash-operation error codes the device can report in bits 5:3
/// of the status word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashErrorKind {
    Ok,
    InvalidCommand,
    InvalidBlock,
    PageLocked,
    WriteFailed,
}

impl fmt::Display for FlashErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlashErrorKind::Ok => "ok",
            FlashErrorKind::InvalidCommand => "invalid command",
            FlashErrorKind::InvalidBlock => "invalid block",
            FlashErrorKind::PageLocked => "page locked",
            FlashErrorKind::WriteFailed => "write failed",
        };
        f.write_str(s)
    }
}

/// A decoded 16-bit device status register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        StatusWord(u16::from_le_bytes(bytes))
    }

    /// Device is idle and ready for the next command.
    pub fn ready(self) -> bool {
        self.0 & READY_BIT != 0
    }

    /// Both id-validation bits are set.
    pub fn id_ok(self) -> bool {
        self.0 & ID_VALID_MASK == ID_VALID_MASK
    }

    /// Checksum-ok indicator. Decoded for completeness; unused downstream.
    pub fn check_ok(self) -> bool {
        self.0 & CHECK_OK_BIT != 0
    }

    /// True when the flash-error field decodes to `Ok`.
    pub fn flash_ok(self) -> bool {
        self.flash_error() == FlashErrorKind::Ok
    }

    /// Decode the flash-operation error field.
    ///
    /// Tested from the most-restrictive mask downward so that `0x18`
    /// resolves as `InvalidCommand` rather than falling through to
    /// `InvalidBlock`.
    pub fn flash_error(self) -> FlashErrorKind {
        let field = self.0 & FLASH_ERROR_MASK;
        if field & 0x18 == 0x18 {
            FlashErrorKind::InvalidCommand
        } else if field & 0x10 != 0 {
            FlashErrorKind::InvalidBlock
        } else if field & 0x08 != 0 {
            FlashErrorKind::PageLocked
        } else if field & 0x04 != 0 {
            FlashErrorKind::WriteFailed
        } else {
            FlashErrorKind::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_bit() {
        assert!(StatusWord(0x0080).ready());
        assert!(!StatusWord(0x0000).ready());
    }

    #[test]
    fn id_ok_requires_both_bits() {
        assert!(!StatusWord(0x0400).id_ok());
        assert!(!StatusWord(0x0800).id_ok());
        assert!(StatusWord(0x0C00).id_ok());
    }

    #[test]
    fn check_ok_bit() {
        assert!(StatusWord(0x2000).check_ok());
        assert!(!StatusWord(0x0000).check_ok());
    }

    #[test]
    fn flash_error_priority() {
        // 0x18 (bits 4:3 both set) -> InvalidCommand, even though 0x10 and
        // 0x08 are individually also set within that value.
        assert_eq!(StatusWord(0x0018).flash_error(), FlashErrorKind::InvalidCommand);
        assert_eq!(StatusWord(0x0010).flash_error(), FlashErrorKind::InvalidBlock);
        assert_eq!(StatusWord(0x0008).flash_error(), FlashErrorKind::PageLocked);
        assert_eq!(StatusWord(0x0004).flash_error(), FlashErrorKind::WriteFailed);
        assert_eq!(StatusWord(0x0000).flash_error(), FlashErrorKind::Ok);
    }

    #[test]
    fn flash_ok_matches_error_decode() {
        assert!(StatusWord(0x0080).flash_ok());
        assert!(!StatusWord(0x0018).flash_ok());
    }

    #[test]
    fn from_le_bytes_roundtrip() {
        // Device sends status little-endian: low byte first.
        let s = StatusWord::from_le_bytes([0x80, 0x2c]);
        assert!(s.ready());
        assert!(s.id_ok());
        assert!(s.check_ok());
    }
}
