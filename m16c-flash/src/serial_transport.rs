// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Transport` implementation backed by a real `serialport` handle.
//!
//! This is the one piece of `m16c-proto::Transport` that ever touches an
//! actual UART; everything else in the protocol engine is exercised
//! against the in-memory mock. 8N1 is requested explicitly on open rather
//! than relying on the crate's own defaults, matching every link-aware
//! host tool in the corpus that cares about serial settings.

use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::Context;
use m16c_proto::Transport;

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Open `device` at `baud`, configured 8N1 with the given whole-second
    /// read timeout.
    pub fn open(device: &str, baud: u32, timeout_secs: u64) -> anyhow::Result<Self> {
        let port = serialport::new(device, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_secs(timeout_secs))
            .open()
            .with_context(|| format!("failed to open serial port {device}"))?;

        log::debug!("opened {device} at {baud} baud, {timeout_secs}s read timeout");
        Ok(SerialTransport { port })
    }
}

fn to_io_error(err: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

impl Transport for SerialTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, buf)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            // A read timeout means "no bytes available right now", not an
            // error; callers detect short reads themselves.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud).map_err(to_io_error)
    }
}
