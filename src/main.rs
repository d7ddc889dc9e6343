#[macro_use]
extern crate log;

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use structopt::StructOpt;

use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};

use stm32_boot_agent::emulator::{Exit, Simulator};
use stm32_boot_agent::integrity::SoftCrc;
use stm32_boot_agent::{linux, Agent, Command, Config, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    op: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Serve the update protocol on the port against an emulated device
    Serve,

    #[structopt(flatten)]
    Host(HostOperation),
}

/// Operations run against a device through the programmer
#[derive(Clone, Debug, StructOpt)]
pub enum HostOperation {
    /// Fetch the bootloader version and supported commands
    Help,

    /// Fetch the bootloader version
    Version,

    /// Fetch the chip ID
    Id,

    /// Start execution at an address
    Go {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
    },

    /// Write a file or hex encoded data to memory
    Write {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,

        /// Binary file to write
        #[structopt(long, conflicts_with = "data", required_unless = "data")]
        file: Option<PathBuf>,

        /// Hex encoded data to write
        #[structopt(long)]
        data: Option<String>,
    },

    /// Erase flash sectors
    Erase {
        #[structopt(parse(try_from_str = parse_u8))]
        sector: u8,

        #[structopt(parse(try_from_str = parse_u8))]
        count: u8,
    },

    /// Erase the whole flash
    MassErase,

    /// Enable write protection for the sectors in a sector code
    WriteProtect {
        #[structopt(parse(try_from_str = parse_u8))]
        sector_count: u8,

        #[structopt(parse(try_from_str = parse_u8))]
        sector_code: u8,
    },

    /// Disable write protection for the sectors in a sector code
    WriteUnprotect {
        #[structopt(parse(try_from_str = parse_u8))]
        sector_count: u8,

        #[structopt(parse(try_from_str = parse_u8))]
        sector_code: u8,
    },

    /// Enable read protection
    ReadoutProtect,

    /// Set read protection to level 0 or 1
    ReadoutUnprotect {
        #[structopt(default_value = "0")]
        level: u8,
    },
}

/// Parse a decimal or 0x prefixed hex value
fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_u8(s: &str) -> Result<u8, anyhow::Error> {
    let v = parse_u32(s)?;
    u8::try_from(v).map_err(|_| anyhow!("{} does not fit in a byte", v))
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, LogConfig::default());

    match &o.op {
        Operation::Serve => serve(&o),
        Operation::Host(op) => host(&o, op),
    }
}

fn host(o: &Args, op: &HostOperation) -> anyhow::Result<()> {
    info!("Connecting to serial port {}", o.port);

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("opening serial port {}", o.port))?;

    p.init().context("resetting device")?;

    match op {
        HostOperation::Help => {
            let (v, commands) = p.get_help()?;
            info!("Version: {}.{}.{} (vendor {})", v.major, v.minor, v.patch, v.vendor);
            for c in commands.iter() {
                match Command::from_opcode(*c) {
                    Some(cmd) => info!("  0x{:02x} {:?}", c, cmd),
                    None => info!("  0x{:02x} (unknown)", c),
                }
            }
        }
        HostOperation::Version => {
            let v = p.version()?;
            info!("Version: {}.{}.{} (vendor {})", v.major, v.minor, v.patch, v.vendor);
        }
        HostOperation::Id => {
            let id = p.chip_id()?;
            info!("ID: 0x{:03x}", id);
        }
        HostOperation::Go { address } => {
            p.go(*address)?;
            info!("Started execution at 0x{:08x}", address);
        }
        HostOperation::Write { address, file, data } => {
            let data = match (file, data) {
                (Some(f), _) => {
                    std::fs::read(f).with_context(|| format!("reading {}", f.display()))?
                }
                (None, Some(d)) => hex::decode(d).context("decoding hex data")?,
                (None, None) => return Err(anyhow!("no data supplied")),
            };

            info!("Writing {} to 0x{:08x}", bytefmt::format(data.len() as u64), address);

            let pb = ProgressBar::new(data.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{bar:40} {bytes}/{total_bytes} ({eta})")
                    .progress_chars("=> "),
            );

            p.write_all(*address, &data, |n| pb.set_position(n as u64))?;

            pb.finish_with_message("done");
        }
        HostOperation::Erase { sector, count } => {
            p.erase(*sector, *count)?;
            info!("Erased {} sectors from {}", count, sector);
        }
        HostOperation::MassErase => {
            p.mass_erase()?;
            info!("Mass erase complete");
        }
        HostOperation::WriteProtect {
            sector_count,
            sector_code,
        } => {
            p.write_protect(*sector_count, *sector_code)?;
            info!("Write protection enabled for 0x{:02x}", sector_code);
        }
        HostOperation::WriteUnprotect {
            sector_count,
            sector_code,
        } => {
            p.write_unprotect(*sector_count, *sector_code)?;
            info!("Write protection disabled for 0x{:02x}", sector_code);
        }
        HostOperation::ReadoutProtect => {
            p.readout_protect()?;
            info!("Read protection enabled");
        }
        HostOperation::ReadoutUnprotect { level } => {
            p.readout_unprotect(*level)?;
            info!("Read protection set to level {}", level);
        }
    }

    Ok(())
}

fn serve(o: &Args) -> anyhow::Result<()> {
    let port = linux::open(&o.port, o.baud)
        .with_context(|| format!("opening serial port {}", o.port))?;

    let config = Config::default();
    let device = Simulator::new(&config);

    info!("Serving emulated device on {} at {} baud", o.port, o.baud);

    let mut agent = Agent::new(port, SoftCrc::new(), device, Exit, config);
    agent.run()
}
