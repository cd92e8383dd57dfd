//! Configuration observation.
//!
//! [`ConfigObserver`] is the contract the port manager consumes: a
//! stream of freshly parsed [`Configs`] plus a stream of non-fatal
//! errors. [`FileConfigObserver`] implements it by polling the
//! workspace and instance configuration files for modification-time
//! changes and re-parsing on change.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::error::ConfigError;
use super::parser::Configs;
use super::schema::{InstancePortsFile, WorkspacePortsFile};

/// Buffer size of the streams returned by [`ConfigObserver::observe`].
const CHANNEL_CAPACITY: usize = 8;

/// Source of port configuration changes.
pub trait ConfigObserver: Send + 'static {
    /// Starts observation and returns the value and error streams.
    ///
    /// The value stream carries a complete [`Configs`] on every change.
    /// Errors are non-fatal; observation continues after reporting one.
    /// Both streams close when the observer shuts down.
    fn observe(&mut self) -> (mpsc::Receiver<Configs>, mpsc::Receiver<anyhow::Error>);
}

/// File identity used to detect changes between polls.
type Fingerprint = Option<(SystemTime, u64)>;

/// Polling file-based configuration observer.
///
/// Watches one workspace file and one instance file (both optional on
/// disk; a missing file contributes an empty section). On a parse or
/// read failure the error is reported and the last good configuration
/// stands.
pub struct FileConfigObserver {
    workspace_path: PathBuf,
    instance_path: PathBuf,
    poll_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl FileConfigObserver {
    /// Creates an observer for the given configuration files.
    pub fn new(
        workspace_path: impl Into<PathBuf>,
        instance_path: impl Into<PathBuf>,
        poll_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            instance_path: instance_path.into(),
            poll_interval,
            shutdown_rx,
        }
    }
}

impl ConfigObserver for FileConfigObserver {
    fn observe(&mut self) -> (mpsc::Receiver<Configs>, mpsc::Receiver<anyhow::Error>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let workspace_path = self.workspace_path.clone();
        let instance_path = self.instance_path.clone();
        let poll_interval = self.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            let mut last: Option<(Fingerprint, Fingerprint)> = None;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let current = (
                            fingerprint(&workspace_path).await,
                            fingerprint(&instance_path).await,
                        );
                        if last.as_ref() == Some(&current) {
                            continue;
                        }
                        match load(&workspace_path, &instance_path).await {
                            Ok(configs) => {
                                last = Some(current);
                                debug!(
                                    workspace = ?workspace_path,
                                    instance = ?instance_path,
                                    "port configuration changed"
                                );
                                if tx.send(configs).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                // Keep `last` untouched so a fixed file
                                // re-triggers a load even if its
                                // fingerprint never changes again. Errors
                                // are dropped when the consumer lags.
                                if let Err(mpsc::error::TrySendError::Full(e)) =
                                    err_tx.try_send(anyhow::Error::new(e))
                                {
                                    trace!(error = %e, "dropping config error, consumer is behind");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("config observer received shutdown signal");
                            return;
                        }
                    }
                }
            }
        });

        (rx, err_rx)
    }
}

async fn fingerprint(path: &Path) -> Fingerprint {
    match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let modified = meta.modified().ok()?;
            Some((modified, meta.len()))
        }
        Err(_) => None,
    }
}

async fn load(workspace_path: &Path, instance_path: &Path) -> Result<Configs, ConfigError> {
    let workspace: WorkspacePortsFile = load_file(workspace_path).await?.unwrap_or_default();
    let instance: InstancePortsFile = load_file(instance_path).await?.unwrap_or_default();
    Ok(Configs::parse(&workspace.ports, &instance.ports))
}

/// Loads and parses one TOML file, returning `None` if it doesn't exist.
async fn load_file<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, ConfigError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let parsed = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })?;
            Ok(Some(parsed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!(path = ?path, "no port configuration file");
            Ok(None)
        }
        Err(e) => Err(ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::OnOpenAction;
    use std::fs;

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_emits_initial_configs_even_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut observer = FileConfigObserver::new(
            dir.path().join("workspace.toml"),
            dir.path().join("instance.toml"),
            POLL,
            shutdown_rx,
        );

        let (mut rx, _err_rx) = observer.observe();
        let configs = rx.recv().await.unwrap();
        assert!(configs.get(8080).is_none());
    }

    #[tokio::test]
    async fn test_emits_on_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace.toml");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut observer = FileConfigObserver::new(
            &workspace,
            dir.path().join("instance.toml"),
            POLL,
            shutdown_rx,
        );

        let (mut rx, _err_rx) = observer.observe();
        let initial = rx.recv().await.unwrap();
        assert!(initial.get(8080).is_none());

        fs::write(&workspace, "[[ports]]\nport = 8080\non-open = \"open-browser\"\n").unwrap();
        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.get(8080).unwrap().on_open, OnOpenAction::OpenBrowser);
    }

    #[tokio::test]
    async fn test_parse_failure_reports_error_and_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace.toml");
        fs::write(&workspace, "not valid toml [[[").unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut observer = FileConfigObserver::new(
            &workspace,
            dir.path().join("instance.toml"),
            POLL,
            shutdown_rx,
        );

        let (mut rx, mut err_rx) = observer.observe();
        let err = err_rx.recv().await.unwrap();
        assert!(err.to_string().contains("parse"));

        fs::write(&workspace, "[[ports]]\nport = 3000\n").unwrap();
        let configs = rx.recv().await.unwrap();
        assert!(configs.get(3000).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams() {
        let dir = tempfile::tempdir().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut observer = FileConfigObserver::new(
            dir.path().join("workspace.toml"),
            dir.path().join("instance.toml"),
            POLL,
            shutdown_rx,
        );

        let (mut rx, _err_rx) = observer.observe();
        rx.recv().await.unwrap();
        shutdown_tx.send(true).unwrap();
        assert!(rx.recv().await.is_none());
    }
}
