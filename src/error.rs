use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

/// Errors reported to a link operation's listener or stream.
///
/// Every variant is recoverable: it ends the one operation it was reported to and leaves the
/// connector or scanner idle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("A connection attempt to this device is already in progress")]
    AlreadyConnecting,

    #[error("Link to device failed with status {0}")]
    LinkFailure(i32),

    #[error("Service discovery could not be started")]
    DiscoverRequestFailed,

    #[error("Service discovery failed with status {0}")]
    DiscoverFailure(i32),

    #[error("Service discovery did not complete in time")]
    DiscoverTimeout,

    #[error("Connecting to device did not complete in time")]
    ConnectTimeout,

    #[error("Device disconnected before its services were ready")]
    PrematureDisconnect,

    #[error("Device is not connected")]
    NotConnected,

    #[error("The requested service or characteristic is not available")]
    ChannelNotFound,

    #[error("Write to characteristic failed with status {0}")]
    WriteFailed(i32),

    #[error("Read from characteristic failed with status {0}")]
    ReadFailed(i32),

    #[error("Failed to change the notification state of the characteristic")]
    NotificationSetupFailed,

    #[error("Scan failed with status {0}")]
    ScanFailed(i32),

    #[error("A scan is already in progress")]
    AlreadyScanning,

    #[error("Permission to scan for devices was denied")]
    PermissionDenied,

    #[error("Bluetooth adapter is not available")]
    AdapterUnavailable,

    #[error("The link worker has stopped")]
    Shutdown,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter found")]
    NoAdapter,

    #[error("No peripheral with address {0} is known to the adapter")]
    UnknownPeripheral(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to load configuration: {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to set up bluetooth: {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("{source}")]
    LinkError { #[from] source: LinkError },

    #[error("Failed to encode output as json: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Failed to set up logging: {source}")]
    LoggingError { #[from] source: fern::InitError },

    #[error("Invalid payload, expected hex: {source}")]
    InvalidPayload { #[from] source: hex::FromHexError },

    #[error("Failed to start the async runtime: {source}")]
    Runtime { source: io::Error },

    #[error("Bluetooth adapter could not be opened")]
    AdapterUnavailable,
}
