use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use msp430_emulator::config::Config;
use msp430_emulator::kv::{KvHandle, MemoryBackend};
use msp430_emulator::metrics::init_metrics;
use msp430_emulator::registry::Registry;
use msp430_emulator::server::{run_server, ServerContext};

#[derive(Debug, Parser)]
#[command(name = "msp430_emulator", about = "MSP430 emulator debug service")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Preload a hex image file into the store, as KEY=PATH
    #[arg(long = "image", value_name = "KEY=PATH")]
    images: Vec<String>,

    /// Log filter, used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

fn parse_image(arg: &str) -> Result<(String, PathBuf)> {
    let (key, path) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("--image wants KEY=PATH, got {}", arg))?;
    Ok((key.to_string(), PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    init_metrics();

    let kv = KvHandle::spawn(MemoryBackend::new()).context("starting key/value actor")?;
    for arg in &args.images {
        let (key, path) = parse_image(arg)?;
        let image = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading image {}", path.display()))?;
        info!(key = %key, path = %path.display(), bytes = image.len(), "preloaded image");
        kv.set(&key, image).await?;
    }

    let registry = Registry::spawn(kv.clone(), config.instance.clone());
    run_server(config.listen, ServerContext { registry, kv }).await;
    Ok(())
}
