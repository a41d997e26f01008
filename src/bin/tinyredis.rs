/*!
 * tinyredis Server Entry Point
 *
 * Resolves configuration, rebuilds the keyspace from the snapshot and
 * append-only log, starts the checkpoint timer and serves clients until
 * one of them sends SHUTDOWN or the process gets SIGINT/SIGTERM. Either
 * way a final snapshot is written before exit.
 */

use anyhow::{Context, Result};
use crossbeam::channel::{tick, unbounded};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use tinyredis::{net, Cli, Config, Shard};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    // RUST_LOG overrides the default filter, e.g. RUST_LOG=debug
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::from_sources(&cli)?;
    log::debug!("configuration: {:?}", config);

    let addr = config
        .addr()
        .to_socket_addrs()
        .with_context(|| format!("invalid listen address {}", config.addr()))?
        .next()
        .with_context(|| format!("{} did not resolve", config.addr()))?;

    let shard = Arc::new(Shard::open(0, &config.persistence()));
    let listener = net::bind(addr)?;

    // Checkpoint timer
    {
        let shard = shard.clone();
        let ticker = tick(Duration::from_secs(1));
        std::thread::Builder::new()
            .name("checkpoint".into())
            .spawn(move || {
                for _ in ticker.iter() {
                    shard.tick();
                }
            })?;
    }

    let (shutdown_tx, shutdown_rx) = unbounded();
    {
        let tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .context("failed to install signal handler")?;
    }
    {
        let shard = shard.clone();
        std::thread::Builder::new()
            .name("accept".into())
            .spawn(move || {
                if let Err(e) = net::serve(listener, shard, shutdown_tx) {
                    log::error!("server stopped: {}", e);
                }
            })?;
    }

    println!("tinyredis running on {}", addr);

    let _ = shutdown_rx.recv();
    if let Err(e) = shard.shutdown() {
        log::error!("final snapshot failed: {}", e);
    }
    log::info!("bye");
    Ok(())
}
