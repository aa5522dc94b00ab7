//! Probekit runtime host
//!
//! Spawned by forked test containers. Starts an in-memory runtime with the
//! diagnostic catalog linked in, prints its RPC port on stdout and serves
//! the controlling connection until the parent closes it.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use probekit_core::framework::{Framework, FrameworkState};
use probekit_core::telemetry::init_tracing;
use probekit_core::{MemoryFramework, ProbeExtender};
use probekit_remote::diagnostics;
use probekit_remote::protocol::LISTENING_PREFIX;
use probekit_remote::FrameworkServer;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "probekit-host")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Runtime host for forked Probekit containers", long_about = None)]
struct Cli {
    /// RPC port on 127.0.0.1 (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Port of the parent's test outcome listener
    #[arg(long)]
    invoker_port: Option<u16>,

    /// Runtime property as KEY=VALUE (repeatable)
    #[arg(long = "framework-property", value_parser = parse_key_value)]
    framework_properties: Vec<(String, String)>,

    /// Host property as KEY=VALUE, visible to tests unless a runtime
    /// property of the same name overrides it (repeatable)
    #[arg(long = "system-property", value_parser = parse_key_value)]
    system_properties: Vec<(String, String)>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Default log level when RUST_LOG is not set
    #[arg(long, env = "PROBEKIT_HOST_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, cli.log_level);

    let mut properties: BTreeMap<String, String> = cli.system_properties.into_iter().collect();
    properties.extend(cli.framework_properties);

    let catalog = diagnostics::catalog();
    let mut extender = ProbeExtender::new(catalog.clone());
    if let Some(port) = cli.invoker_port {
        extender = extender.with_invoker_port(port);
    }
    let framework: Arc<dyn Framework> =
        Arc::new(MemoryFramework::new(properties, catalog).with_extender(Arc::new(extender)));

    let listener = TcpListener::bind(("127.0.0.1", cli.port))
        .await
        .context("Failed to bind runtime port")?;
    let port = listener.local_addr()?.port();
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{LISTENING_PREFIX}{port}")?;
        stdout.flush()?;
    }
    info!(port, invoker_port = ?cli.invoker_port, "runtime host listening");

    let (stream, peer) = listener.accept().await.context("Failed to accept controller")?;
    info!(peer = %peer, "controller connected");
    let server = FrameworkServer::new(Arc::clone(&framework));
    if let Err(e) = server.serve_connection(stream).await {
        warn!(error = %e, "controller connection failed");
    }

    if !matches!(framework.state().await?, FrameworkState::Stopped | FrameworkState::Created) {
        info!("controller gone, stopping runtime");
        framework.stop().await?;
        framework.wait_for_stop(SHUTDOWN_WAIT).await?;
    }
    info!("runtime host exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        assert_eq!(
            parse_key_value("acme.mode=a=b").unwrap(),
            ("acme.mode".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn cli_accepts_repeated_properties() {
        let cli = Cli::parse_from([
            "probekit-host",
            "--invoker-port",
            "20001",
            "--framework-property",
            "a=1",
            "--framework-property",
            "b=2",
            "--system-property",
            "c=3",
        ]);
        assert_eq!(cli.invoker_port, Some(20001));
        assert_eq!(cli.framework_properties.len(), 2);
        assert_eq!(cli.system_properties[0], ("c".to_string(), "3".to_string()));
        assert_eq!(cli.port, 0);
    }
}
