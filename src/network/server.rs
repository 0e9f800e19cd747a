//! TCP Server
//!
//! Accepts connections and serves each on its own thread.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use super::connection::{Handler, ServerConnection};

/// How long the accept loop sleeps when no client is waiting
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Blocking responder server
pub struct Server {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<dyn Handler>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind to `config.listen_addr`
    pub fn bind<H: Handler>(config: Config, handler: H) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen_addr)?;
        // Non-blocking accept so the loop can notice shutdown
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            config,
            listener,
            local_addr,
            handler: Arc::new(handler),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` is called (blocking)
    pub fn run(&self) -> Result<()> {
        tracing::info!("Listening on {}", self.local_addr);

        while !self.shutdown.load(Ordering::Relaxed) {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let mut connection =
                match ServerConnection::new(stream, Arc::clone(&self.handler), &self.config) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("Failed to set up connection: {}", e);
                        continue;
                    }
                };

            thread::spawn(move || {
                if let Err(e) = connection.handle() {
                    tracing::warn!("Connection {} ended with error: {}", connection.peer_addr(), e);
                }
            });
        }

        tracing::info!("Server on {} stopped", self.local_addr);
        Ok(())
    }

    /// Signal the accept loop to stop
    ///
    /// Connections already being served run until their clients disconnect.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
