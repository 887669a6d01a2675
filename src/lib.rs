use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::info;

use crate::cli::{Cli, CliCommand};
use crate::config::io::ConfigIO;
use crate::config::types::LinkConfig;
use crate::device::btle::{default_adapter, BtleRadio};
use crate::device::{AlwaysGranted, LinkClient, PeerAddress};
use crate::error::{AppRunError, LinkError};

pub mod cli;
pub mod config;
pub mod device;
pub mod error;

pub fn init_logging(level: log::LevelFilter) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}

async fn load_config(path: Option<PathBuf>) -> Result<LinkConfig, AppRunError> {
    let io = match path {
        Some(path) => ConfigIO::new(path),
        None => ConfigIO::from_default_location()?,
    };

    Ok(io.read_or_default().await?)
}

async fn first<T>(mut stream: BoxStream<'static, Result<T, LinkError>>) -> Result<T, LinkError> {
    stream.next().await.unwrap_or(Err(LinkError::Shutdown))
}

// Most hosts only connect to peripherals they have seen in a scan.
async fn find_and_connect(client: &LinkClient, address: &PeerAddress, config: &LinkConfig) -> Result<(), AppRunError> {
    info!("Looking for {}", address);
    let mut peers = client.search(config.scan_duration(), true);

    while let Some(peer) = peers.next().await {
        if peer?.address == *address {
            break;
        }
    }
    drop(peers);
    client.stop_search().await?;

    first(client.connect(address.clone())).await?;
    info!("{} is ready", address);
    Ok(())
}

async fn run_command(client: &LinkClient, command: CliCommand, config: &LinkConfig) -> Result<(), AppRunError> {
    let address = command.address();
    let channel = command.channel();

    if let Some(address) = &address {
        find_and_connect(client, address, config).await?;
    }

    match (command, address, channel) {
        (CliCommand::Scan { duration, json }, _, _) => {
            let mut peers = client.search(duration.unwrap_or(config.scan_duration()), false);

            while let Some(peer) = peers.next().await {
                let peer = peer?;
                if json {
                    println!("{}", serde_json::to_string(&peer)?);
                } else {
                    println!("{}  {:>4} dBm  {}", peer.address, peer.signal_strength, peer.display_name);
                }
            }
        },
        (CliCommand::Connect { .. }, Some(address), _) => {
            println!("{} ready", address);
        },
        (CliCommand::Read { .. }, Some(address), Some(channel)) => {
            let value = first(client.read(address, channel)).await?;
            println!("{}", hex::encode(value));
        },
        (CliCommand::Write { payload, .. }, Some(address), Some(channel)) => {
            let value = hex::decode(payload.trim_start_matches("0x"))?;
            first(client.write(address.clone(), channel, value)).await?;
            println!("{} written", channel);
        },
        (CliCommand::Notify { count, .. }, Some(address), Some(channel)) => {
            let notifications = client.register_notify(address, channel);
            let mut notifications = match count {
                Some(count) => notifications.take(count).boxed(),
                None => notifications,
            };

            while let Some(value) = notifications.next().await {
                println!("{}", hex::encode(value?));
            }
        },
        _ => {},
    }

    Ok(())
}

async fn run_async(cli: Cli) -> Result<(), AppRunError> {
    let config = load_config(cli.config).await?;
    let adapter = default_adapter().await?;
    let client = LinkClient::with_config(Box::new(BtleRadio::new(adapter)), Arc::new(AlwaysGranted), &config);

    if !client.open_radio().await {
        return Err(AppRunError::AdapterUnavailable);
    }

    let result = run_command(&client, cli.command, &config).await;
    if let Err(err) = client.clean_all().await {
        info!("Cleanup skipped: {}", err);
    }
    client.shutdown().await;
    result
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_async(cli))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn stream_ending_without_an_item_means_the_worker_is_gone() {
        let empty = stream::empty::<Result<(), LinkError>>().boxed();
        assert_eq!(first(empty).await, Err(LinkError::Shutdown));

        let one = stream::iter(vec![Ok(5), Err(LinkError::NotConnected)]).boxed();
        assert_eq!(first(one).await, Ok(5));
    }
}
