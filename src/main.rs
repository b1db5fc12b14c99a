use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use sift::{BoundNode, HttpCrawler};

#[derive(Parser, Debug)]
#[command(name = "sift")]
#[command(author, version, about = "Decentralized web-search overlay node", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:4410")]
    bind: SocketAddr,

    /// Leading zero bits required of admission puzzles; also the floor
    /// applied to inbound certificates.
    #[arg(short, long, default_value = "8")]
    difficulty: u32,

    /// Capacity of the rank-refinement queue; queries observed beyond it
    /// are dropped.
    #[arg(long, default_value = "1024")]
    rank_queue_capacity: usize,

    /// Known peers to exchange certificates with at startup.
    #[arg(short = 'B', long = "bootstrap", value_name = "HOST:PORT")]
    bootstrap: Vec<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let crawler = Arc::new(HttpCrawler::new().context("failed to build crawler")?);
    let node = BoundNode::bind(
        &args.bind.to_string(),
        args.difficulty,
        crawler,
        args.rank_queue_capacity,
    )
    .await
    .context("failed to start node")?;

    info!(
        address = %node.node().address(),
        listen = %node.local_addr()?,
        "node online"
    );

    for peer in &args.bootstrap {
        match node.node().bootstrap(&peer.to_string()).await {
            Ok(()) => info!(peer = %peer, "bootstrap complete"),
            Err(err) => warn!(peer = %peer, error = %err, "bootstrap failed"),
        }
    }

    // The rank-refinement loop lives outside the overlay; until one is
    // attached, drain its queue so the channel never sits full.
    if let Some(mut rank_updates) = node.take_rank_updates() {
        tokio::spawn(async move {
            while let Some(target) = rank_updates.recv().await {
                debug!(target = %target, "rank refresh requested");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("received shutdown signal, exiting gracefully");

    node.shutdown().await;
    Ok(())
}
