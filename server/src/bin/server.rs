//! Engine server binary: load config, bind listeners, echo messages.
//!
//! The echo handler stands in for the embedding layer; real deployments
//! link the engine crates and supply their own [`EventHandler`].

use clap::Parser;
use engine_net::{CloseReason, ConnId, EventHandler, SessionManager};
use server::{metrics, Config, Engine};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "engine-server", about = "Game server engine core")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

struct EchoHandler;

impl EventHandler for EchoHandler {
    fn on_accept(&mut self, _net: &mut SessionManager, conn_id: ConnId, peer: SocketAddr) {
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        info!(conn = %conn_id, %peer, "accepted");
    }

    fn on_message(&mut self, net: &mut SessionManager, conn_id: ConnId, msg: &[u8]) {
        metrics::MESSAGES_RECEIVED.increment();
        metrics::BYTES_RECEIVED.add(msg.len() as u64);
        if net.send(conn_id, msg).is_ok() {
            metrics::MESSAGES_SENT.increment();
            metrics::BYTES_SENT.add(msg.len() as u64);
        }
    }

    fn on_close(&mut self, _net: &mut SessionManager, conn_id: ConnId, reason: CloseReason) {
        metrics::CONNECTIONS_ACTIVE.decrement();
        metrics::CONNECTIONS_CLOSED.increment();
        if reason == CloseReason::Protocol {
            metrics::PROTOCOL_ERRORS.increment();
        }
        info!(conn = %conn_id, ?reason, "closed");
    }
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    server::logging::init(&config.logging);

    if config.listener.is_empty() {
        warn!("no listeners configured; the server will sit idle");
    }

    let mut engine = match Engine::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("engine startup failed: {e}");
            std::process::exit(1);
        }
    };

    info!(backend = engine.net.backend_name(), "serving");
    if let Err(e) = engine.run(&mut EchoHandler, |_, _| {}) {
        eprintln!("event loop failed: {e}");
        std::process::exit(1);
    }
}
