//! Stand a proxy topology up for manual poking.
//!
//! Usage:
//!   tandem --topology chain --chain-length 3 --tls

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tandem::{logging, Harness, HarnessConfig, TopologyKind};

#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML harness configuration; flags below override it
    #[arg(short, long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// explicit, transparent, reverse or chain
    #[arg(short, long)]
    topology: Option<TopologyKind>,

    /// Serve TLS on the backends and intercept TLS at the proxy
    #[arg(long)]
    tls: bool,

    /// Number of hops in chain mode
    #[arg(long)]
    chain_length: Option<usize>,

    /// Disable the embedded applications
    #[arg(long)]
    no_apps: bool,
}

impl Args {
    fn harness_config(&self) -> anyhow::Result<HarnessConfig> {
        let mut config = match self.config {
            Some(ref path) => HarnessConfig::from_file(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(topology) = self.topology {
            config.topology = topology;
        }
        if self.tls {
            config.tls = true;
        }
        if let Some(hops) = self.chain_length {
            config.chain_length = hops;
        }
        if self.no_apps {
            config.apps = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();
    let config = args.harness_config()?;

    // Setup blocks on background threads' ready channels.
    let mut harness = tokio::task::spawn_blocking(move || Harness::setup(config))
        .await
        .context("setup task panicked")??;

    println!("topology: {}", harness.kind());
    println!("proxy:    {}", harness.proxies());
    for (i, hop) in harness.chain().iter().enumerate().skip(1) {
        println!("hop {i}:    {} ({})", hop.addr(), hop.kind());
    }
    println!("server:   {}", harness.server().urlbase());
    println!("server2:  {}", harness.server2().urlbase());
    println!("confdir:  {}", harness.confdir().display());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    tokio::task::spawn_blocking(move || harness.teardown())
        .await
        .context("teardown task panicked")??;
    Ok(())
}
