//! Local port proxies.
//!
//! A served port bound to loopback only is unreachable from outside the
//! workspace. The manager bridges it by running a *local proxy*: a TCP
//! listener on an allocated global port (all interfaces) forwarding
//! every connection to `127.0.0.1:local_port`.
//!
//! ```text
//!   outside ──► 0.0.0.0:60000 ──forward──► 127.0.0.1:8080 (user process)
//! ```
//!
//! [`ProxyRegistry`] tracks which local ports currently have a proxy.
//! The actual proxy implementation is injected as a [`ProxyStarter`] so
//! tests can substitute a recording stub; [`local_proxy_starter`] is
//! the production implementation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{PortsError, PortsResult};

/// Future returned by a [`ProxyStarter`].
pub type ProxyStartFuture = Pin<Box<dyn Future<Output = PortsResult<ProxyHandle>> + Send>>;

/// Factory starting a proxy from a global port to a local port.
///
/// Invoked as `starter(local_port, global_port)`. A failure aborts only
/// this port's proxy attempt; the manager retries on a later event.
pub type ProxyStarter = Box<dyn Fn(u16, u16) -> ProxyStartFuture + Send + Sync>;

/// Handle to a running proxy.
///
/// Closing consumes the handle, so a proxy cannot be shut down twice.
pub struct ProxyHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Wraps a proxy task and its shutdown signal.
    pub fn new(shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Stops the proxy and its in-flight connections.
    pub fn close(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

struct ProxyEntry {
    global_port: u16,
    handle: ProxyHandle,
}

/// Registry of active local proxies, keyed by local port.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: HashMap<u16, ProxyEntry>,
}

impl ProxyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a proxy from `global` to `local` unless one is already
    /// running for `local`.
    pub async fn ensure(
        &mut self,
        local: u16,
        global: u16,
        starter: &ProxyStarter,
    ) -> PortsResult<()> {
        if self.proxies.contains_key(&local) {
            return Ok(());
        }
        let handle = starter(local, global).await?;
        self.proxies.insert(
            local,
            ProxyEntry {
                global_port: global,
                handle,
            },
        );
        Ok(())
    }

    /// Closes and removes the proxy for `local`, returning the global
    /// port it occupied.
    pub fn release(&mut self, local: u16) -> Option<u16> {
        let entry = self.proxies.remove(&local)?;
        entry.handle.close();
        debug!(local, global = entry.global_port, "released local proxy");
        Some(entry.global_port)
    }

    /// The global port proxying `local`, if any.
    pub fn global_for(&self, local: u16) -> Option<u16> {
        self.proxies.get(&local).map(|entry| entry.global_port)
    }

    /// Local ports that currently have a proxy.
    pub fn locals(&self) -> Vec<u16> {
        self.proxies.keys().copied().collect()
    }

    /// Closes every proxy.
    pub fn close_all(&mut self) {
        for (local, entry) in self.proxies.drain() {
            debug!(local, global = entry.global_port, "closing local proxy");
            entry.handle.close();
        }
    }

    /// Number of active proxies.
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// Whether no proxy is active.
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

/// Production proxy starter: listens on `0.0.0.0:global` and forwards
/// to `127.0.0.1:local`.
pub fn local_proxy_starter() -> ProxyStarter {
    Box::new(|local, global| Box::pin(start_local_proxy(local, global)))
}

async fn start_local_proxy(local: u16, global: u16) -> PortsResult<ProxyHandle> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], global)))
        .await
        .map_err(|e| PortsError::ListenFailed {
            port: global,
            source: e,
        })?;

    info!(local, global, "local proxy listening");

    let target = SocketAddr::from(([127, 0, 0, 1], local));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(global, %peer_addr, "proxy connection accepted");
                            tokio::spawn(forward_connection(stream, target));
                        }
                        Err(e) => {
                            debug!(global, error = %e, "proxy accept error");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(local, global, "local proxy shutting down");
                        break;
                    }
                }
            }
        }
    });

    Ok(ProxyHandle::new(shutdown_tx, task))
}

/// Forwards a single connection to the local target.
async fn forward_connection(mut downstream: TcpStream, target: SocketAddr) {
    let mut upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%target, error = %e, "proxy target refused connection");
            return;
        }
    };

    let (mut down_read, mut down_write) = downstream.split();
    let (mut up_read, mut up_write) = upstream.split();

    let down_to_up = tokio::io::copy(&mut down_read, &mut up_write);
    let up_to_down = tokio::io::copy(&mut up_read, &mut down_write);

    tokio::select! {
        result = down_to_up => {
            if let Err(e) = result {
                debug!(error = %e, "downstream copy ended");
            }
        }
        result = up_to_down => {
            if let Err(e) = result {
                debug!(error = %e, "upstream copy ended");
            }
        }
    }
}
