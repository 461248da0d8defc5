//! Chain head tracker.
//!
//! Follows the head of a node through HTTP polling and a WebSocket `newHeads`
//! subscription, and logs every new head until interrupted:
//!
//! ```text
//!   Node (HTTP) --poll-->  |
//!                          |--> BlockSub --> new head log
//!   Node (WS) --newHeads-->|
//! ```

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use blocksub::{BlockSub, Config, HeaderFetcher, HeaderSubscriber, RpcHeaderFetcher, WsHeaderSubscriber};
use clap::Parser;
use futures::future::select_all;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "blocksub")]
#[command(about = "Track the chain head of an Ethereum node via polling and newHeads")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// HTTP JSON-RPC endpoint to poll.
    #[arg(long, env = "ETH_HTTP")]
    http_url: Option<Url>,

    /// WebSocket endpoint to subscribe to.
    #[arg(long, env = "ETH_WS")]
    ws_url: Option<Url>,

    /// Log every polled and received header.
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

fn init_tracing(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.debug, cli.log_json);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if cli.http_url.is_some() {
        config.http_url = cli.http_url;
    }
    if cli.ws_url.is_some() {
        config.ws_url = cli.ws_url;
    }
    if cli.metrics_addr.is_some() {
        config.metrics_addr = cli.metrics_addr;
    }
    config.blocksub.debug |= cli.debug;

    if config.http_url.is_none() && config.ws_url.is_none() {
        bail!("Neither an HTTP nor a WebSocket endpoint is configured (set ETH_HTTP or ETH_WS)");
    }

    if let Some(addr) = config.metrics_addr {
        blocksub::init_metrics(addr).context("installing Prometheus exporter")?;
        info!(%addr, "Serving metrics");
    }

    let fetcher = config.http_url.clone().map(|url| {
        let mut fetcher = RpcHeaderFetcher::new(url);
        if let Some(timeout) = config.request_timeout() {
            fetcher = fetcher.with_timeout(timeout);
        }
        info!(url = %fetcher.url(), "Polling endpoint configured");
        Arc::new(fetcher) as Arc<dyn HeaderFetcher>
    });
    let subscriber = config.ws_url.clone().map(|url| {
        let subscriber = WsHeaderSubscriber::new(url);
        info!(url = %subscriber.url(), "Subscription endpoint configured");
        Arc::new(subscriber) as Arc<dyn HeaderSubscriber>
    });

    let blocksub = BlockSub::new(config.blocksub.clone(), fetcher, subscriber);

    // Subscribe first so the head fetched during start is not missed.
    let shutdown_token = CancellationToken::new();
    let mut subscription = blocksub.subscribe(&shutdown_token);

    blocksub.start().await?;

    let printer = tokio::spawn(async move {
        while let Some(header) = subscription.recv().await {
            info!(number = header.number(), hash = %header.hash(), "New head");
        }
    });

    info!("Tracking chain head, waiting for shutdown signal");

    let mut signals: Vec<_> = [SignalKind::interrupt(), SignalKind::terminate()]
        .into_iter()
        .filter_map(|kind| signal(kind).ok())
        .collect();

    if signals.is_empty() {
        bail!("No shutdown signals could be registered");
    }

    let _ = select_all(signals.iter_mut().map(|s| Box::pin(s.recv()))).await;

    info!("Received shutdown signal, shutting down");

    shutdown_token.cancel();
    blocksub.shutdown().await;
    if let Err(e) = printer.await {
        warn!(error = %e, "Head printer task failed");
    }

    info!("Stopped, exiting");

    Ok(())
}
