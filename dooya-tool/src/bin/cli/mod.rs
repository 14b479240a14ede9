pub use clap::StructOpt;
use clap::{Parser, Subcommand};

use dooya_lib::protocol::{DeviceAddress, Direction};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip port sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// RS-485 serial device or 'auto'
    #[clap(long, short, default_value = "auto")]
    pub port: String,

    /// Per-command attempt budget
    #[clap(long, short, default_value_t = 6)]
    pub attempts: usize,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open the curtain fully
    Open { address: DeviceAddress },

    /// Close the curtain fully
    Close { address: DeviceAddress },

    /// Stop the motor
    Stop { address: DeviceAddress },

    /// Move to an absolute position
    Position {
        address: DeviceAddress,
        /// Target position, percent (0-100)
        percent: u8,
    },

    /// Set the rotation direction
    SetDirection {
        address: DeviceAddress,
        /// 'direct' or 'reverse'
        direction: Direction,
    },

    /// Query position, motion state and direction
    Status { address: DeviceAddress },

    /// Query the protocol version
    Probe { address: DeviceAddress },

    /// Put a device into programming mode and assign it this address
    Program { address: DeviceAddress },
}

impl Commands {
    pub fn address(&self) -> DeviceAddress {
        match *self {
            Commands::Open { address }
            | Commands::Close { address }
            | Commands::Stop { address }
            | Commands::Position { address, .. }
            | Commands::SetDirection { address, .. }
            | Commands::Status { address }
            | Commands::Probe { address }
            | Commands::Program { address } => address,
        }
    }
}
