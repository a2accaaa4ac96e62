use anyhow::Result;
use clap::Parser;

use mimosa::config::Config;
use mimosa::runtime::install_signal_handler;
use mimosa::runtime::BaseStation;

/// Software massive-MIMO OFDM base station.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> Result<()> {
    mimosa::logging::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let mut bs = BaseStation::new(config)?;
    install_signal_handler(bs.running_token());
    bs.run()
}
