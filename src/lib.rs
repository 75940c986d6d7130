pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod hooks;
pub mod instance;
pub mod paths;
pub mod process;
pub mod resource;
pub mod restart;
pub mod revision;
pub mod store;
pub mod tail;
pub mod validation;

use std::process::ExitCode;

use clap::Parser as _;

use cli::Cli;
pub use error::{AppError, ErrorKind, Result};
pub use instance::{InstanceController, InstanceDeps, InstanceRegistry};

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(commands::dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
