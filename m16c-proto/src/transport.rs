// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The I/O seam the protocol engine is generic over.
//!
//! `FlasherSession` never touches a concrete serial port type; it's
//! generic over `Transport` so the state machine can be driven by an
//! in-memory mock in tests and by a real `serialport`-backed
//! implementation in `m16c-flash`. All methods are blocking, matching
//! the single-threaded, synchronous request/response model the M16C boot
//! ROM protocol requires.

use std::io;

/// A bounded-time byte pipe with baud-rate control.
pub trait Transport {
    /// Write the entire buffer, blocking until done or an error occurs.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes, blocking up to the transport's
    /// configured timeout. Returns the number of bytes actually read,
    /// which may be less than `buf.len()` on timeout: callers detect
    /// short reads themselves rather than treating a partial read as an
    /// error at this layer.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reconfigure the link to a new baud rate.
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;

    /// Block the calling thread for the given duration. Exists on the
    /// trait (rather than calling `std::thread::sleep` directly from the
    /// protocol engine) purely so tests can use a mock clock that doesn't
    /// actually sleep.
    fn sleep(&mut self, duration: std::time::Duration) {
        std::thread::sleep(duration);
    }

    /// Read exactly `buf.len()` bytes by repeatedly calling `read_some`
    /// until the buffer is full or a call returns zero bytes (timeout).
    /// Returns the total number of bytes actually read.
    fn read_exact_or_short(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    //! An in-memory `Transport` used by `m16c-proto`'s own tests and
    //! available to downstream crates under the `mock` feature for their
    //! own orchestrator-level tests.

    use super::Transport;
    use std::collections::VecDeque;
    use std::io;

    /// A mock transport with scripted reply bytes and a record of every
    /// byte written to it, plus the baud rates it was asked to switch to.
    #[derive(Default)]
    pub struct MockTransport {
        pub replies: VecDeque<u8>,
        pub written: Vec<u8>,
        pub baud_history: Vec<u32>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_replies(bytes: impl IntoIterator<Item = u8>) -> Self {
            Self {
                replies: bytes.into_iter().collect(),
                ..Default::default()
            }
        }

        pub fn queue(&mut self, bytes: impl IntoIterator<Item = u8>) {
            self.replies.extend(bytes);
        }
    }

    impl Transport for MockTransport {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.replies.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
            self.baud_history.push(baud);
            Ok(())
        }

        fn sleep(&mut self, _duration: std::time::Duration) {
            // Tests don't want to actually wait.
        }
    }
}
