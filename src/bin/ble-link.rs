use clap::Parser;
use log::{error, info};
use ble_link::cli::Cli;
use ble_link::error::AppRunError;
use ble_link::{init_logging, run};

fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();
    init_logging(cli.log_level())?;
    info!(concat!("ble-link ", env!("CARGO_PKG_VERSION")));

    if let Err(err) = run(cli) {
        error!("{}", err);
        return Err(err);
    }

    Ok(())
}
