use crate::cmd::{init_logger, Args};
use clap::Parser;
use std::process;

mod artifacts;
mod cache;
mod cleanup;
mod cmd;
mod common;
mod config;
mod context;
mod errors;
mod image;
mod manifest;
mod provision;
mod remote;
mod runner;
mod scheduler;
mod session;
mod snapshot;
mod sshagent;
mod workload;

/// Errors carry a [`crate::errors::FailureKind`] in their chain so that the
/// process can exit with a distinct code per failure class.
#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(args.log_level);
    if let Err(e) = cmd::run(args).await {
        eprintln!("Error: {:?}", e);
        process::exit(errors::exit_code(&e));
    }
}
