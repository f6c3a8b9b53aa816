//! Engine server assembly.
//!
//! Ties the session manager, configuration, logging, and worker threads
//! together into a runnable server. Domain logic lives with the
//! embedding; this crate provides the scaffolding around it.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::Config;

use engine_net::{EventHandler, SessionManager};
use io_reactor::Event;
use std::io;
use tracing::info;

/// A configured engine: the session manager with listeners bound.
pub struct Engine {
    pub net: SessionManager,
}

impl Engine {
    /// Build the session layer and bind every configured listener.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let mut net = SessionManager::new(config.session())?;
        for listener in &config.listener {
            let conn_id = net.listen_with(
                &listener.host,
                listener.port,
                listener.framer,
                listener.conn_type,
            )?;
            info!(conn = %conn_id, host = %listener.host, port = listener.port, "listener bound");
        }
        Ok(Self { net })
    }

    /// Drive the loop until stop is requested, then drain and shut down.
    /// Timer and wake events the session layer does not own are routed
    /// through `on_event`, which is where worker `main_routine` dispatch
    /// belongs.
    pub fn run(
        &mut self,
        handler: &mut dyn EventHandler,
        mut on_event: impl FnMut(&mut SessionManager, &Event),
    ) -> io::Result<()> {
        let mut out = Vec::new();
        while !self.net.stop_requested() {
            out.clear();
            self.net.poll_once(handler, &mut out)?;
            for ev in &out {
                on_event(&mut self.net, ev);
            }
        }
        self.net.shutdown(handler)
    }
}
