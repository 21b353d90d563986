// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol engine and S-Record loader for the Renesas M16C family's
//! serial boot-ROM flashing mode.
//!
//! This crate has no knowledge of any particular serial port library or
//! CLI: it exposes [`Transport`], the I/O seam a concrete transport
//! implements, and [`FlasherSession`], the state machine that drives the
//! wire protocol over it. Loading an application image is a separate,
//! pure pipeline: [`srec::parse`] turns an S-Record stream into raw
//! address-keyed records, and [`merge::merge`] coalesces those into the
//! contiguous [`Segment`]s that [`FlasherSession::segment_write`] consumes.

pub mod error;
pub mod merge;
pub mod segment;
pub mod session;
pub mod srec;
pub mod status;
pub mod transport;

pub use error::{Error, Result};
pub use segment::{PagePlan, Segment, MAX_ADDRESS, PAGE_SIZE};
pub use session::{FlasherSession, DEFAULT_ID_ADDR, MAX_READY_POLLS, SUPPORTED_BAUD_RATES};
pub use status::{FlashErrorKind, StatusWord};
pub use transport::Transport;
