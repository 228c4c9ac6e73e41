//! veild - anonymous circuit daemon
//!
//! Maintains a directory of verified peers, builds multi-hop onion
//! circuits over UDP, and optionally relays circuits for other nodes.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use veild::config::Config;
use veild::node::Node;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("veild={level}").parse().unwrap())
        .add_directive(format!("veilpipe_net={level}").parse().unwrap());
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!("veild v{} - anonymous circuit daemon", env!("CARGO_PKG_VERSION"));

    match Node::new(config).await {
        Ok(node) => {
            let handle = node.handle();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("received shutdown signal");
                let _ = handle.shutdown.send(());
            });

            if let Err(e) = node.run().await {
                error!("node error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("failed to initialize node: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
