mod agent;
mod cli;
mod cmd;
mod command;
mod config;
mod image;
mod ipc;
mod logger;
mod network;
mod profile;
mod project;
mod runtime;
mod sandbox;
mod session;
mod spinner;
mod tmux;
mod vault;
mod workspace;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "exitbox start");

    match cli::run() {
        Ok(result) => {
            info!("exitbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "exitbox failed");
            Err(err)
        }
    }
}
