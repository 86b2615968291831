//! chainstore - per-node storage and chain-replication engine.
//!
//! Thin CLI entry point: parses a handful of flags, opens the engine
//! against a data directory, and runs until interrupted. Real inter-node
//! transport and cluster configuration are out of scope (spec.md §1) — this
//! binary wires up a `LoopbackBus` and a `NullConfigService` so the engine
//! can be exercised standalone.

use std::path::PathBuf;
use std::panic;
use std::sync::Arc;

use chainstore::bus::LoopbackBus;
use chainstore::coordinator::NullConfigService;
use chainstore::ids::VirtualServerId;
use chainstore::{Daemon, EngineConfig};

struct Args {
    data_dir: PathBuf,
    bind_address: String,
    coordinator_address: String,
    server_id: u64,
}

fn parse_args() -> Args {
    let mut data_dir = PathBuf::from("./data");
    let mut bind_address = "127.0.0.1:2012".to_string();
    let mut coordinator_address = "127.0.0.1:1982".to_string();
    let mut server_id = 1u64;

    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        match flag.as_str() {
            "--data-dir" => {
                if let Some(v) = it.next() {
                    data_dir = PathBuf::from(v);
                }
            }
            "--bind-address" => {
                if let Some(v) = it.next() {
                    bind_address = v;
                }
            }
            "--coordinator-address" => {
                if let Some(v) = it.next() {
                    coordinator_address = v;
                }
            }
            "--server-id" => {
                if let Some(v) = it.next() {
                    server_id = v.parse().unwrap_or(server_id);
                }
            }
            other => {
                eprintln!("chainstore: unrecognized flag {other}");
            }
        }
    }

    Args {
        data_dir,
        bind_address,
        coordinator_address,
        server_id,
    }
}

fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("chainstore fatal error:");
        eprintln!("{}", panic_info);
        if let Some(location) = panic_info.location() {
            eprintln!("location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let args = parse_args();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  chainstore — per-node storage and chain-replication engine");
    log::info!("  version: {}", chainstore::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  data dir:            {}", args.data_dir.display());
    log::info!("  bind address:        {}", args.bind_address);
    log::info!("  coordinator address: {}", args.coordinator_address);
    log::info!("  server id:           {}", args.server_id);

    let config = EngineConfig {
        data_dir: args.data_dir,
        server_id: Some(chainstore::ids::ServerId::new(args.server_id)),
        ..Default::default()
    };

    let bus = Arc::new(LoopbackBus::new());
    let coordinator = Arc::new(NullConfigService);
    let self_vs = VirtualServerId::new(args.server_id);
    bus.register(self_vs);

    log::info!("opening data layer and starting background workers...");
    let daemon = Daemon::open(&config, bus, coordinator, self_vs)?;
    log::info!("chainstore is up. Press enter to shut down.");

    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    log::info!("shutting down...");
    daemon.shutdown();
    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  chainstore shutdown complete");
    log::info!("═══════════════════════════════════════════════════════════");
    Ok(())
}
