#![crate_name = "fuji_gw"]

pub mod app;
pub mod broker;
pub mod config;
pub mod device;
pub mod gateway;
pub mod message;
pub mod payload;
pub mod topic;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::Result;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "fuji-gw", about = "MQTT edge gateway bridging local devices to priority-ranked brokers")]
struct Cli {
    /// Path to the gateway's ini-flavored configuration file.
    #[arg(short = 'c', long = "conf", env = "FUJI_CONFIG_FILE", default_value = "/etc/fuji-gw/config.ini")]
    conf: PathBuf,

    /// Enables debug-level logging.
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = setup(cli.debug) {
        eprintln!("could not initialize: {e}");
        return ExitCode::FAILURE;
    }

    match app::run(&cli.conf).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gateway exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn setup(debug: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0");
    }
    color_eyre::install()?;

    let level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();

    Ok(())
}
