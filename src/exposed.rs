//! Observation and control of exposed ports.
//!
//! An *exposed port* has an exposure record in the control plane: a
//! public URL plus the global port under which it is reachable from
//! outside the workspace. The manager consumes exposure changes through
//! [`ExposedPortObserver::observe`] and requests new exposures through
//! [`ExposedPortObserver::expose`]; the success of a request is only
//! ever visible as a later emission on the observe stream.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// A port with a control-plane exposure record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExposedPort {
    /// The workspace-local port the exposure targets.
    pub local_port: u16,
    /// The externally reachable port.
    pub global_port: u16,
    /// Whether anyone with the URL can connect, or only the owner.
    pub public: bool,
    /// Public URL of the exposure.
    pub url: String,
}

/// Source of exposure changes and sink for exposure requests.
pub trait ExposedPortObserver: Send + 'static {
    /// Starts observation and returns the value and error streams.
    ///
    /// The value stream carries the complete current exposure set on
    /// every change. Errors are non-fatal; observation continues after
    /// reporting one. Both streams close when the observer shuts down.
    fn observe(&mut self)
    -> (mpsc::Receiver<Vec<ExposedPort>>, mpsc::Receiver<anyhow::Error>);

    /// Requests that `local` be exposed under `global`.
    ///
    /// Idempotent. Completion does not mean the exposure exists yet;
    /// watch the observe stream for that.
    fn expose(
        &self,
        local: u16,
        global: u16,
        public: bool,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Exposed-port observer for workspaces without a control plane.
///
/// Emits nothing, accepts every request, and closes its streams on
/// shutdown, so the manager runs unchanged in disconnected workspaces.
pub struct NoopExposedPorts {
    shutdown_rx: watch::Receiver<bool>,
}

impl NoopExposedPorts {
    /// Creates a no-op observer that shuts down with the given signal.
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { shutdown_rx }
    }
}

impl ExposedPortObserver for NoopExposedPorts {
    fn observe(
        &mut self,
    ) -> (mpsc::Receiver<Vec<ExposedPort>>, mpsc::Receiver<anyhow::Error>) {
        let (tx, rx) = mpsc::channel::<Vec<ExposedPort>>(1);
        let (err_tx, err_rx) = mpsc::channel::<anyhow::Error>(1);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            // Hold the senders until shutdown so the streams stay open
            // without ever yielding.
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            drop(tx);
            drop(err_tx);
        });
        (rx, err_rx)
    }

    async fn expose(&self, local: u16, global: u16, public: bool) -> anyhow::Result<()> {
        debug!(local, global, public, "no control plane, ignoring exposure request");
        Ok(())
    }
}
