// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a `FlasherSession` through a user-selected sequence of actions.
//!
//! Everything protocol-shaped lives in `m16c-proto`; this module only
//! sequences calls into it, owns the files an action reads from or
//! writes to, and translates `m16c_proto::Error` into the single
//! diagnostic line the CLI surfaces on exit.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use m16c_proto::segment::plan_pages;
use m16c_proto::{merge, srec, FlasherSession, Transport, DEFAULT_ID_ADDR};

/// One `--address addr[:len]` occurrence from the command line.
#[derive(Clone, Copy, Debug)]
pub struct AddressRange {
    pub address: u32,
    pub length: Option<usize>,
}

/// Everything the orchestrator needs that isn't part of the protocol
/// engine itself: link parameters and the authentication identity.
pub struct OrchestratorConfig {
    pub baud: u32,
    pub device_id: Option<Vec<u8>>,
    pub device_id_addr: u32,
    pub no_clock_validation: bool,
    pub unsafe_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            baud: 9600,
            device_id: None,
            device_id_addr: DEFAULT_ID_ADDR,
            no_clock_validation: false,
            unsafe_mode: false,
        }
    }
}

/// One user-requested operation, as selected on the command line.
pub enum Action {
    StatusRead,
    StatusClear,
    VersionRead,
    IdValidate,
    FlashRead { ranges: Vec<AddressRange>, output: Option<PathBuf> },
    FlashWrite { input: Option<PathBuf> },
    FlashErase { ranges: Vec<AddressRange> },
    FlashEraseAll,
    FlashProgram { input: Option<PathBuf> },
}

pub struct Orchestrator<T: Transport> {
    session: FlasherSession<T>,
    config: OrchestratorConfig,
    authenticated: bool,
}

impl<T: Transport> Orchestrator<T> {
    /// Bring the link up: clock-validate and negotiate baud (or, per
    /// `config`, skip validation entirely or recover from a failed
    /// handshake) and return an orchestrator ready to dispatch actions.
    pub fn new(transport: T, config: OrchestratorConfig) -> Result<Self> {
        let mut session = FlasherSession::new(transport);

        if config.no_clock_validation {
            log::warn!("skipping clock validation (--no-clock-validation)");
            session.baud_set_force(config.baud)?;
        } else {
            match session.clock_validate() {
                Ok(()) => {
                    session.baud_set(config.baud)?;
                }
                Err(e) if config.unsafe_mode => {
                    log::warn!(
                        "clock validation failed ({e}); forcing baud rate and clearing status per --unsafe"
                    );
                    session.baud_set_force(config.baud)?;
                    session.status_clear_unchecked()?;
                }
                Err(e) => return Err(e).context("clock validation failed"),
            }
        }

        log::info!("link up at {} baud", session.baud());
        Ok(Orchestrator {
            session,
            config,
            authenticated: false,
        })
    }

    fn id_validate(&mut self) -> Result<()> {
        let Some(id) = self.config.device_id.clone() else {
            bail!("this action requires --device-id");
        };
        self.session
            .id_validate(&id, self.config.device_id_addr)
            .context("device id validation failed")?;
        self.authenticated = true;
        log::info!("device id validated");
        Ok(())
    }

    fn ensure_authenticated(&mut self) -> Result<()> {
        if self.authenticated {
            return Ok(());
        }
        self.id_validate()
    }

    /// Run every action in order, stopping at the first failure (spec
    /// §7's propagation policy: no retries, the device is left as-is).
    pub fn run(&mut self, actions: &[Action]) -> Result<()> {
        for action in actions {
            self.run_one(action)?;
        }
        Ok(())
    }

    fn run_one(&mut self, action: &Action) -> Result<()> {
        match action {
            Action::StatusRead => {
                let status = self.session.status_read().context("status read failed")?;
                log::info!(
                    "status: ready={} id_ok={} check_ok={} flash_ok={}",
                    status.ready(),
                    status.id_ok(),
                    status.check_ok(),
                    status.flash_ok()
                );
                println!("{:#06x}", status.0);
            }
            Action::StatusClear => {
                self.ensure_authenticated()?;
                self.session.status_clear().context("status clear failed")?;
                log::info!("status cleared");
            }
            Action::VersionRead => {
                let version = self.session.version_read().context("version read failed")?;
                log::info!("firmware version: {}", hex::encode(version));
                println!("{}", hex::encode(version));
            }
            Action::IdValidate => self.id_validate()?,
            Action::FlashRead { ranges, output } => self.flash_read(ranges, output.as_deref())?,
            Action::FlashWrite { input } => self.flash_write(input.as_deref())?,
            Action::FlashErase { ranges } => self.flash_erase(ranges)?,
            Action::FlashEraseAll => {
                self.ensure_authenticated()?;
                self.session.block_erase_all().context("erase-all failed")?;
                log::info!("erase-all complete");
            }
            Action::FlashProgram { input } => {
                self.id_validate()?;
                self.session.block_erase_all().context("erase-all failed")?;
                log::info!("erase-all complete");
                self.flash_write_unchecked(input.as_deref())?;
            }
        }
        Ok(())
    }

    fn flash_read(&mut self, ranges: &[AddressRange], output: Option<&std::path::Path>) -> Result<()> {
        self.ensure_authenticated()?;

        let mut sink: Box<dyn Write> = match output {
            Some(path) => Box::new(BufWriter::new(
                File::create(path).with_context(|| format!("can't create {}", path.display()))?,
            )),
            None => Box::new(io::stdout().lock()),
        };

        for range in ranges {
            let length = range
                .length
                .ok_or_else(|| anyhow::anyhow!("flash-read requires an address:length range"))?;
            log::info!("reading 0x{:06x}..0x{:06x}", range.address, range.address as u64 + length as u64);

            for plan in plan_pages(range.address, length)? {
                let page = self.session.page_read(plan.page_addr).context("page read failed")?;
                sink.write_all(&page[plan.start_off..plan.end_off])?;
            }
        }
        sink.flush()?;
        Ok(())
    }

    fn flash_write(&mut self, input: Option<&std::path::Path>) -> Result<()> {
        self.ensure_authenticated()?;
        self.flash_write_unchecked(input)
    }

    /// Writes the S-Record image without re-checking authentication;
    /// `flash-program` calls this directly since it already id-validated.
    fn flash_write_unchecked(&mut self, input: Option<&std::path::Path>) -> Result<()> {
        let mut reader: Box<dyn Read> = match input {
            Some(path) => Box::new(
                File::open(path).with_context(|| format!("can't open {}", path.display()))?,
            ),
            None => Box::new(io::stdin().lock()),
        };

        let records = srec::parse(&mut reader).context("S-Record parse failed")?;
        let segments = merge::merge(records);
        log::info!("loaded {} segment(s)", segments.len());

        for segment in &segments {
            log::info!(
                "writing 0x{:06x}..0x{:06x} ({} bytes)",
                segment.start,
                segment.end(),
                segment.data.len()
            );
            self.session.segment_write(segment).context("segment write failed")?;
        }
        Ok(())
    }

    fn flash_erase(&mut self, ranges: &[AddressRange]) -> Result<()> {
        self.ensure_authenticated()?;
        for range in ranges {
            self.session.block_erase(range.address).context("block erase failed")?;
            log::info!("erased block at 0x{:06x}", range.address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m16c_proto::transport::mock::MockTransport;

    fn bring_up(replies: impl IntoIterator<Item = u8>, baud: u32) -> Orchestrator<MockTransport> {
        let transport = MockTransport::with_replies(replies);
        let config = OrchestratorConfig {
            baud,
            ..Default::default()
        };
        Orchestrator::new(transport, config).unwrap()
    }

    #[test]
    fn bring_up_validates_and_sets_baud() {
        let o = bring_up([0xB0, 0xB0, 0xB0], 9600);
        assert_eq!(o.session.baud(), 9600);
    }

    #[test]
    fn unsafe_mode_forces_baud_on_handshake_failure() {
        let transport = MockTransport::with_replies([0xAA]);
        let config = OrchestratorConfig {
            baud: 19200,
            unsafe_mode: true,
            ..Default::default()
        };
        let o = Orchestrator::new(transport, config).unwrap();
        assert_eq!(o.session.baud(), 19200);
        assert!(o.session.clock_validated());
    }

    #[test]
    fn authenticated_action_without_device_id_is_rejected() {
        let mut o = bring_up([0xB0, 0xB0, 0xB0], 9600);
        let err = o.run(&[Action::StatusClear]).unwrap_err();
        assert!(err.to_string().contains("--device-id"));
    }
}
