use std::path::PathBuf;
use std::time::Duration;
use clap::{ArgAction, Parser, Subcommand};
use uuid::Uuid;

use crate::device::types::{Channel, PeerAddress};

#[derive(Parser, Debug)]
#[command(name = "ble-link", version, about = "Scan for and talk to BLE peripherals")]
pub struct Cli {
    /// More output; repeat for even more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of the one in the user config directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// List nearby peripherals
    Scan {
        /// How long to scan, for example "5s" or "1m"
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Print one JSON object per peripheral
        #[arg(long)]
        json: bool,
    },

    /// Connect, wait until the services are known, then disconnect
    Connect {
        address: String,
    },

    /// Read a characteristic and print its value as hex
    Read {
        address: String,
        service: Uuid,
        characteristic: Uuid,
    },

    /// Write a hex encoded value to a characteristic
    Write {
        address: String,
        service: Uuid,
        characteristic: Uuid,
        payload: String,
    },

    /// Print notifications of a characteristic as hex
    Notify {
        address: String,
        service: Uuid,
        characteristic: Uuid,

        /// Stop after this many notifications
        #[arg(long)]
        count: Option<usize>,
    },
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

impl CliCommand {
    /// The peripheral this command talks to, if any.
    pub fn address(&self) -> Option<PeerAddress> {
        match self {
            CliCommand::Scan { .. } => None,
            CliCommand::Connect { address }
            | CliCommand::Read { address, .. }
            | CliCommand::Write { address, .. }
            | CliCommand::Notify { address, .. } => Some(PeerAddress::new(address.as_str())),
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        match self {
            CliCommand::Read { service, characteristic, .. }
            | CliCommand::Write { service, characteristic, .. }
            | CliCommand::Notify { service, characteristic, .. } => Some(Channel::new(*service, *characteristic)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_write_command() {
        let cli = Cli::parse_from([
            "ble-link", "-vv", "write", "AA:11",
            "0000180d-0000-1000-8000-00805f9b34fb",
            "00002a37-0000-1000-8000-00805f9b34fb",
            "0102",
        ]);

        assert_eq!(cli.log_level(), log::LevelFilter::Trace);
        assert_eq!(cli.command.address(), Some(PeerAddress::from("AA:11")));
        assert_eq!(
            cli.command.channel(),
            Some(Channel::new(Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb), Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb))),
        );
    }

    #[test]
    fn parses_scan_duration() {
        let cli = Cli::parse_from(["ble-link", "scan", "--duration", "1m", "--json"]);

        match cli.command {
            CliCommand::Scan { duration, json } => {
                assert_eq!(duration, Some(Duration::from_secs(60)));
                assert!(json);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }
}
