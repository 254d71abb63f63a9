pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod testing;
pub mod utils;

use clap::Parser;

pub fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = cli::Cli::parse();
    log::info!("StayActive starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli::execute(cli))
}
