//! rexd - Remote execution daemon
//!
//! CLI entry point: load the TOML configuration, assemble the service, and
//! run the configured transport (stdio or HTTP/WS).

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rexd::server::{http, stdio, Service};
use rexd_core::config::Config;

/// Remote execution daemon exposing a sandboxed workspace over JSON-RPC.
#[derive(Debug, Parser)]
#[command(name = "rexd", version)]
struct Args {
    /// Path to the rexd config file
    #[arg(long, default_value = "/etc/rexd/config.toml")]
    config: PathBuf,

    /// Run JSON-RPC on stdio
    #[arg(long)]
    stdio: bool,

    /// Listen address for the HTTP/WS transport
    #[arg(long)]
    http: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = Config::load(&args.config).context("failed to load configuration")?;
    if let Some(addr) = args.http {
        cfg.server.http_listen = addr;
        if !args.stdio {
            cfg.server.stdio = false;
        }
    }
    if args.stdio {
        cfg.server.stdio = true;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "rexd={level},rexd_core={level}",
                    level = cfg.server.log_level
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rexd");
    let service = Arc::new(Service::new(cfg.clone()).context("failed to assemble service")?);

    if cfg.server.stdio {
        info!("stdio transport active");
        tokio::select! {
            result = stdio::run(service, tokio::io::stdin(), tokio::io::stdout()) => {
                result.context("stdio server failed")?;
            }
            () = http::shutdown_signal() => {}
        }
        return Ok(());
    }

    if cfg.server.http_listen.is_empty() {
        bail!("either --stdio or --http must be configured");
    }
    http::run(service, &cfg).await
}
