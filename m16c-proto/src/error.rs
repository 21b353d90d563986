// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy for the M16C protocol engine.
//!
//! Kinds mirror the device-facing failure modes: a mismatch during the
//! clock handshake is distinct from a device-reported flash error, which
//! is distinct from the host's serial link simply timing out. Keeping
//! these as a closed enum (rather than an opaque `anyhow::Error`) lets
//! callers pattern-match and decide what, if anything, is recoverable.

use thiserror::Error;

use crate::status::FlashErrorKind;

/// Errors raised by the `m16c-proto` protocol engine and S-Record loader.
#[derive(Debug, Error)]
pub enum Error {
    /// The oscillator handshake's echoed byte didn't match what was sent.
    #[error("clock validation handshake failed")]
    HandshakeFailed,

    /// Requested baud rate isn't one of the four the device supports.
    #[error("unsupported baud rate: {0}")]
    InvalidBaud(u32),

    /// Device didn't echo the baud-set command byte.
    #[error("baud rate negotiation failed")]
    BaudNegotiation,

    /// Post-command status didn't show the id-validated bits set.
    #[error("device id validation failed")]
    IdValidationFailed,

    /// An operation requiring clock and/or id validation was issued too early.
    #[error("operation requires {0} first")]
    NotValidated(&'static str),

    /// The serial port returned fewer bytes than the operation required.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// The device reported a flash operation error at the given address.
    #[error("flash error at 0x{address:06x}: {kind}")]
    FlashError {
        kind: FlashErrorKind,
        address: u32,
    },

    /// The ready-wait poll loop exceeded its retry budget.
    #[error("device never became ready (address 0x{address:06x?})")]
    ReadyTimeout { address: Option<u32> },

    /// S-Record framing, hex, checksum, line-ending, or length violation.
    #[error("S-Record syntax error: {0}")]
    SRecordSyntax(String),

    /// Requested address lies beyond the theoretical flash range.
    #[error("address 0x{0:06x} is out of range")]
    AddressOutOfRange(u32),

    /// Underlying serial port I/O failure.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
