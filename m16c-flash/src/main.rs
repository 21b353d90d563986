// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line driver for the M16C serial boot-ROM flasher.
//!
//! All of the actions below are flags rather than subcommands, and can be
//! combined in a single invocation (`m16c-flash -d /dev/ttyUSB0
//! --flash-erase-all --flash-write -i app.srec`). This mirrors the
//! original tool's option-as-action design, where each action flag
//! appends a closure to a run list instead of selecting one of several
//! subcommands.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

mod orchestrator;
mod serial_transport;

use orchestrator::{Action, AddressRange, Orchestrator, OrchestratorConfig};
use serial_transport::SerialTransport;

/// Flash utility for the Renesas M16C serial boot-ROM protocol.
#[derive(Debug, Parser)]
#[clap(max_term_width = 80)]
struct Cli {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(flatten)]
    actions: ActionArgs,
}

#[derive(Debug, Parser)]
struct CommonArgs {
    /// The serial device, e.g. /dev/ttyUSB0 or COM3.
    #[clap(short, long)]
    device: String,

    /// The baud rate to negotiate after clock validation.
    #[clap(short, long, default_value_t = 9600)]
    baud_rate: u32,

    /// Serial read timeout, in whole seconds.
    #[clap(short, long, default_value_t = 5)]
    timeout: u64,

    /// The device id used to validate the device, as colon-separated hex
    /// bytes (e.g. ae:23:3a:dd:ea:32:3f). Required by any authenticated
    /// action unless --id-validate has already run this invocation.
    #[clap(long)]
    device_id: Option<String>,

    /// Address of the device-id region. Accepts decimal or 0x-prefixed hex.
    #[clap(long)]
    device_id_addr: Option<String>,

    /// Skip the oscillator handshake entirely and assume the link is
    /// already at --baud-rate.
    #[clap(short = 'n', long)]
    no_clock_validation: bool,

    /// Address range for flash-read/flash-erase, format addr[:len].
    /// Accepts decimal or 0x-prefixed hex for either field. May be given
    /// more than once; applies accumulatively to whichever of
    /// --flash-read/--flash-erase is selected.
    #[clap(short, long = "address")]
    addresses: Vec<String>,

    /// Input file for --flash-write/--flash-program. Reads stdin if omitted.
    #[clap(short, long)]
    input_file: Option<PathBuf>,

    /// Output file for --flash-read. Writes stdout if omitted.
    #[clap(short, long)]
    output_file: Option<PathBuf>,

    /// Enable unsafe assumptions: recover from a failed clock-validate
    /// handshake by forcing the baud rate instead of aborting. Do not use
    /// unless you know what you are doing.
    #[clap(short, long = "unsafe")]
    unsafe_mode: bool,
}

#[derive(Debug, Parser)]
struct ActionArgs {
    /// Convenience: id-validate (if needed), erase-all, then flash-write.
    #[clap(long)]
    flash_program: bool,

    #[clap(long)]
    status_read: bool,

    #[clap(long)]
    status_clear: bool,

    #[clap(long)]
    version_read: bool,

    #[clap(long)]
    flash_read: bool,

    #[clap(long)]
    flash_write: bool,

    #[clap(long)]
    flash_erase: bool,

    #[clap(long)]
    flash_erase_all: bool,

    #[clap(long)]
    id_validate: bool,
}

fn parse_numeric(s: &str) -> Result<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).with_context(|| format!("invalid hex value {s:?}"))
    } else {
        s.parse::<u32>().with_context(|| format!("invalid decimal value {s:?}"))
    }
}

fn parse_address_range(s: &str) -> Result<AddressRange> {
    let mut parts = s.splitn(2, ':');
    let addr = parts.next().unwrap();
    let address = parse_numeric(addr).context("invalid address in --address")?;
    let length = match parts.next() {
        Some(len) => Some(parse_numeric(len).context("invalid length in --address")? as usize),
        None => None,
    };
    Ok(AddressRange { address, length })
}

fn parse_device_id(s: &str) -> Result<Vec<u8>> {
    let id: Vec<u8> = s
        .split(':')
        .map(|field| {
            let value = parse_numeric(field)?;
            u8::try_from(value).with_context(|| format!("device id field {value} out of range (0..=255)"))
        })
        .collect::<Result<_>>()?;
    if id.len() > 7 {
        bail!("--device-id accepts at most 7 bytes, got {}", id.len());
    }
    Ok(id)
}

/// Builds the ordered action list. Order is fixed (not the order flags
/// appeared on the command line, since clap's per-flag booleans don't
/// preserve that the way the original's per-flag callback list did):
/// id-validate runs first so later actions in the same invocation are
/// already authenticated, erase precedes write.
fn build_actions(args: &ActionArgs, ranges: Vec<AddressRange>, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<Vec<Action>> {
    let mut actions = Vec::new();

    if args.id_validate {
        actions.push(Action::IdValidate);
    }
    if args.status_read {
        actions.push(Action::StatusRead);
    }
    if args.status_clear {
        actions.push(Action::StatusClear);
    }
    if args.version_read {
        actions.push(Action::VersionRead);
    }
    if args.flash_read {
        if ranges.is_empty() {
            bail!("--flash-read requires at least one --address addr:len");
        }
        actions.push(Action::FlashRead { ranges: ranges.clone(), output });
    }
    if args.flash_erase {
        if ranges.is_empty() {
            bail!("--flash-erase requires at least one --address");
        }
        actions.push(Action::FlashErase { ranges: ranges.clone() });
    }
    if args.flash_erase_all {
        actions.push(Action::FlashEraseAll);
    }
    if args.flash_write {
        actions.push(Action::FlashWrite { input: input.clone() });
    }
    if args.flash_program {
        actions.push(Action::FlashProgram { input });
    }

    if actions.is_empty() {
        bail!("no action was given, nothing to do");
    }
    Ok(actions)
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let device_id = cli
        .common
        .device_id
        .as_deref()
        .map(parse_device_id)
        .transpose()
        .context("invalid --device-id")?;
    let device_id_addr = match &cli.common.device_id_addr {
        Some(s) => parse_numeric(s).context("invalid --device-id-addr")?,
        None => m16c_proto::DEFAULT_ID_ADDR,
    };
    let ranges = cli
        .common
        .addresses
        .iter()
        .map(|s| parse_address_range(s))
        .collect::<Result<Vec<_>>>()?;

    let actions = build_actions(
        &cli.actions,
        ranges,
        cli.common.input_file.clone(),
        cli.common.output_file.clone(),
    )?;

    let transport = SerialTransport::open(&cli.common.device, cli.common.baud_rate, cli.common.timeout)?;

    let config = OrchestratorConfig {
        baud: cli.common.baud_rate,
        device_id,
        device_id_addr,
        no_clock_validation: cli.common.no_clock_validation,
        unsafe_mode: cli.common.unsafe_mode,
    };

    let mut orchestrator = Orchestrator::new(transport, config)?;

    if let Err(err) = orchestrator.run(&actions) {
        log::error!("{err:#}");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }

    Ok(())
}
