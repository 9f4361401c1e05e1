//! Standalone frame-protocol server that answers every request with OK.
//!
//! Point a channel at `ws://<host>:<port>/command-gateway/ui/ws` to exercise
//! it end to end.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use opchannel_client::logging::{init_tracing, LogFormat};
use opchannel_client::testing::{echo_ok, TestServer};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "test-server", about = "Echo server for the operation channel")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "OPCHANNEL_TEST_HOST", default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on; 0 picks a free one.
    #[arg(long, env = "OPCHANNEL_TEST_PORT", default_value_t = 8080)]
    port: u16,
    #[arg(long, env = "OPCHANNEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format).context("failed to install tracing subscriber")?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
    let server = TestServer::bind(addr, echo_ok)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %server.local_addr(), "serving; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
