use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use warren::dht::{Config, Dht};
use warren::id::NodeId;

#[derive(Parser, Debug)]
struct Cli {
    #[clap(short, long, default_value = "0.0.0.0:6881", help = "UDP address to listen on")]
    bind: SocketAddr,
    #[clap(
        short,
        long,
        default_value = "router.bittorrent.com:6881",
        help = "seed node to bootstrap against"
    )]
    seed: String,
    #[clap(short, long, help = "hex info-hash to search peers for")]
    info_hash: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let mut config = Config::default();
    if let Some(hex) = &args.info_hash {
        let info_hash =
            NodeId::from_hex(hex).ok_or_else(|| anyhow!("info-hash must be 40 hex characters"))?;
        config.search = Some(info_hash);
    }

    let seed = resolve_seed(&args.seed)?;
    let mut dht = Dht::new(args.bind, config)?;
    dht.start();
    dht.bootstrap(seed)?;

    loop {
        thread::sleep(Duration::from_secs(60));
        info!("known nodes: {}", dht.contact_count());
    }
}

/// first IPv4 address a host:port pair resolves to
fn resolve_seed(seed: &str) -> Result<SocketAddrV4> {
    let addrs = seed
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve seed {}", seed))?;
    for addr in addrs {
        if let SocketAddr::V4(addr) = addr {
            return Ok(addr);
        }
    }
    Err(anyhow!("seed {} has no IPv4 address", seed))
}
