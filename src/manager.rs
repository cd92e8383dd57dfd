//! The port manager.
//!
//! A single reconciliation loop consumes three independent streams of
//! truth (served ports from the kernel, exposed ports from the control
//! plane, declared ports from configuration) and derives the
//! authoritative per-port status table. On every inbound event it
//! re-derives the table, opens or closes local proxies, requests
//! missing exposures, and publishes the resulting [`Diff`] to
//! subscribers.
//!
//! # Architecture
//!
//! ```text
//!  served observer ──┐
//!  exposed observer ─┼──► reconciliation loop ──► diffs ──► subscribers
//!  config observer ──┘         │        │
//!                              │        └──► Expose(local, global, public)
//!                              └──► local proxies (loopback → global)
//! ```
//!
//! The loop is the sole mutator of manager state. Subscription
//! registration and unregistration travel through the same multiplex as
//! provider events, so no lock is ever taken on the reconciliation
//! path. Side effects are awaited inline; collaborators are expected to
//! return promptly and to offload anything long-running.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::allocator::GlobalPortAllocator;
use crate::config::{ConfigObserver, Configs, PortVisibility};
use crate::diff::Diff;
use crate::error::{PortsError, PortsResult};
use crate::exposed::{ExposedPort, ExposedPortObserver};
use crate::proxy::{ProxyRegistry, ProxyStarter};
use crate::served::{ServedPort, ServedPortObserver};
use crate::status::{ExposedInfo, PortStatus, on_exposed_action};
use crate::subscriptions::{DEFAULT_BACKLOG, Subscription, SubscriptionHub};

/// Buffer size of the handle-to-loop command channel.
const COMMAND_CAPACITY: usize = 8;

enum Command {
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
}

/// Reconciles served, exposed and configured ports into one status
/// table.
///
/// Constructed with the three observers, the set of supervisor-internal
/// ports (never surfaced to subscribers), and the proxy starter. Grab a
/// [`ManagerHandle`] before calling [`Manager::run`]; the handle is the
/// only way to subscribe or read status while the loop runs.
pub struct Manager<E, S, C> {
    exposed: E,
    served: S,
    config: C,
    internal_ports: HashSet<u16>,
    proxy_starter: ProxyStarter,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    closed_tx: mpsc::UnboundedSender<u64>,
    closed_rx: mpsc::UnboundedReceiver<u64>,
    snapshot_tx: watch::Sender<Vec<PortStatus>>,
}

impl<E, S, C> Manager<E, S, C>
where
    E: ExposedPortObserver,
    S: ServedPortObserver,
    C: ConfigObserver,
{
    /// Creates a manager over the given collaborators.
    pub fn new(
        exposed: E,
        served: S,
        config: C,
        internal_ports: impl IntoIterator<Item = u16>,
        proxy_starter: ProxyStarter,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            exposed,
            served,
            config,
            internal_ports: internal_ports.into_iter().collect(),
            proxy_starter,
            cmd_tx,
            cmd_rx,
            closed_tx,
            closed_rx,
            snapshot_tx,
        }
    }

    /// Returns a cloneable handle for subscribing and reading status.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            cmd_tx: self.cmd_tx.clone(),
            snapshot_rx: self.snapshot_tx.subscribe(),
        }
    }

    /// Runs the reconciliation loop.
    ///
    /// Returns once all three observer value streams have closed. On
    /// the way out every proxy is closed and every remaining
    /// subscription drains and terminates.
    pub async fn run(self) {
        let Manager {
            mut exposed,
            mut served,
            mut config,
            internal_ports,
            proxy_starter,
            cmd_tx,
            mut cmd_rx,
            closed_tx,
            mut closed_rx,
            snapshot_tx,
        } = self;

        let (mut exposed_rx, mut exposed_errs) = exposed.observe();
        let (mut served_rx, mut served_errs) = served.observe();
        let (mut config_rx, mut config_errs) = config.observe();

        // Handles hold their own clones; keeping ours would stop the
        // command stream from ever closing.
        drop(cmd_tx);

        let mut rec = Reconciler {
            exposed,
            internal_ports,
            proxy_starter,
            allocator: GlobalPortAllocator::new(),
            proxies: ProxyRegistry::new(),
            hub: SubscriptionHub::new(DEFAULT_BACKLOG, closed_tx),
            snapshot_tx,
            served_set: Vec::new(),
            exposed_set: Vec::new(),
            configs: Configs::default(),
            submitted: HashMap::new(),
            state: BTreeMap::new(),
        };

        let mut exposed_open = true;
        let mut served_open = true;
        let mut config_open = true;
        let mut exposed_errs_open = true;
        let mut served_errs_open = true;
        let mut config_errs_open = true;
        let mut commands_open = true;

        info!("port manager running");
        while exposed_open || served_open || config_open {
            tokio::select! {
                update = exposed_rx.recv(), if exposed_open => match update {
                    Some(ports) => rec.exposed_changed(ports).await,
                    None => {
                        debug!("exposed port stream closed");
                        exposed_open = false;
                    }
                },
                update = served_rx.recv(), if served_open => match update {
                    Some(ports) => rec.served_changed(ports).await,
                    None => {
                        debug!("served port stream closed");
                        served_open = false;
                    }
                },
                update = config_rx.recv(), if config_open => match update {
                    Some(configs) => rec.config_changed(configs).await,
                    None => {
                        debug!("config stream closed");
                        config_open = false;
                    }
                },
                err = exposed_errs.recv(), if exposed_errs_open => match err {
                    Some(e) => warn!(error = %e, "exposed port observation error"),
                    None => exposed_errs_open = false,
                },
                err = served_errs.recv(), if served_errs_open => match err {
                    Some(e) => warn!(error = %e, "served port observation error"),
                    None => served_errs_open = false,
                },
                err = config_errs.recv(), if config_errs_open => match err {
                    Some(e) => warn!(error = %e, "config observation error"),
                    None => config_errs_open = false,
                },
                cmd = cmd_rx.recv(), if commands_open => match cmd {
                    Some(Command::Subscribe { reply }) => {
                        let initial = rec.initial_diff();
                        let subscription = rec.hub.subscribe(initial);
                        let _ = reply.send(subscription);
                    }
                    None => commands_open = false,
                },
                closed = closed_rx.recv() => if let Some(id) = closed {
                    rec.hub.unsubscribe(id);
                },
            }
        }

        rec.shutdown();
        info!("port manager stopped");
    }
}

/// Cloneable handle to a running [`Manager`].
#[derive(Clone)]
pub struct ManagerHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<Vec<PortStatus>>,
}

impl ManagerHandle {
    /// Registers a new subscriber.
    ///
    /// Subscriptions are independent; each receives every diff from the
    /// moment of registration, preceded by an initial diff that adds
    /// the current snapshot (delivered only when non-empty).
    pub async fn subscribe(&self) -> PortsResult<Subscription> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe { reply: reply_tx })
            .await
            .map_err(|_| PortsError::ManagerClosed)?;
        reply_rx.await.map_err(|_| PortsError::ManagerClosed)
    }

    /// The current status snapshot, sorted by local port ascending.
    pub fn status(&self) -> Vec<PortStatus> {
        self.snapshot_rx.borrow().clone()
    }
}

/// Loop-private reconciliation state. All mutation happens here, on the
/// loop task.
struct Reconciler<E> {
    exposed: E,
    internal_ports: HashSet<u16>,
    proxy_starter: ProxyStarter,
    allocator: GlobalPortAllocator,
    proxies: ProxyRegistry,
    hub: SubscriptionHub,
    snapshot_tx: watch::Sender<Vec<PortStatus>>,
    served_set: Vec<ServedPort>,
    exposed_set: Vec<ExposedPort>,
    configs: Configs,
    /// Last submitted `(global, public)` exposure target per port, kept
    /// so an in-flight request is not repeated every event.
    submitted: HashMap<u16, (u16, bool)>,
    state: BTreeMap<u16, PortStatus>,
}

impl<E: ExposedPortObserver> Reconciler<E> {
    async fn served_changed(&mut self, update: Vec<ServedPort>) {
        debug!(count = update.len(), "served ports changed");
        self.served_set = update;
        self.reconcile().await;
    }

    async fn exposed_changed(&mut self, update: Vec<ExposedPort>) {
        debug!(count = update.len(), "exposed ports changed");
        self.exposed_set = update
            .into_iter()
            .filter(|port| !self.internal_ports.contains(&port.local_port))
            .collect();
        self.reconcile().await;
    }

    async fn config_changed(&mut self, configs: Configs) {
        debug!("port configuration changed");
        self.configs = configs;
        self.reconcile().await;
    }

    fn initial_diff(&self) -> Option<Diff> {
        if self.state.is_empty() {
            return None;
        }
        Some(Diff {
            added: self.state.values().cloned().collect(),
            ..Diff::default()
        })
    }

    async fn reconcile(&mut self) {
        let served = self.effective_served();
        self.sync_proxies(&served).await;
        let new_state = self.derive_state(&served);
        self.submit_exposures(&served, &new_state).await;

        let diff = Diff::between(&self.state, &new_state);
        self.state = new_state;
        self.snapshot_tx
            .send_replace(self.state.values().cloned().collect());
        if !diff.is_empty() {
            self.hub.publish(&diff);
        }
    }

    /// The served set as the rest of the reconciliation sees it: one
    /// entry per port, without internal ports, and without sockets that
    /// are really our own proxy listeners.
    fn effective_served(&self) -> BTreeMap<u16, bool> {
        let mut folded: BTreeMap<u16, bool> = BTreeMap::new();
        for port in &self.served_set {
            if self.internal_ports.contains(&port.port) {
                continue;
            }
            if self.allocator.owns(port.port) {
                continue;
            }
            let local_only = folded.entry(port.port).or_insert(true);
            *local_only = *local_only && port.bound_to_localhost_only;
        }
        folded
    }

    /// Closes proxies that lost their loopback-bound server and starts
    /// the missing ones, assigning globals in ascending local-port
    /// order so equivalent inputs yield identical assignments.
    async fn sync_proxies(&mut self, served: &BTreeMap<u16, bool>) {
        let stale: Vec<u16> = self
            .proxies
            .locals()
            .into_iter()
            .filter(|local| served.get(local) != Some(&true))
            .collect();
        for local in stale {
            if let Some(global) = self.proxies.release(local) {
                self.allocator.release(global);
            }
        }

        let reserved: HashSet<u16> = served
            .keys()
            .copied()
            .chain(self.internal_ports.iter().copied())
            .collect();
        for (&local, &local_only) in served {
            if !local_only || self.proxies.global_for(local).is_some() {
                continue;
            }
            let global = match self.allocator.allocate(&reserved) {
                Ok(global) => global,
                Err(e) => {
                    warn!(local, error = %e, "cannot allocate a global port");
                    continue;
                }
            };
            match self.proxies.ensure(local, global, &self.proxy_starter).await {
                Ok(()) => info!(local, global, "started local proxy"),
                Err(e) => {
                    warn!(local, global, error = %e, "failed to start local proxy");
                    self.allocator.release(global);
                }
            }
        }
    }

    /// Derives the status table from the current served set, exposure
    /// set and configuration.
    fn derive_state(&self, served: &BTreeMap<u16, bool>) -> BTreeMap<u16, PortStatus> {
        let mut candidates: BTreeSet<u16> = served.keys().copied().collect();
        candidates.extend(self.exposed_set.iter().map(|port| port.local_port));
        candidates.extend(self.configs.single_ports());
        candidates.retain(|port| !self.internal_ports.contains(port));

        let mut state = BTreeMap::new();
        for local in candidates {
            let exposure = self
                .exposed_set
                .iter()
                .find(|port| port.local_port == local);
            // A stale exposure may still name a global that the
            // allocator has since handed to another port's proxy; such
            // a global must never be adopted here.
            let exposure_global = exposure
                .map(|e| e.global_port)
                .filter(|g| !self.allocator.owns(*g));
            let mut served_flag = served.contains_key(&local);
            let global = match served.get(&local) {
                Some(true) => match self.proxies.global_for(local) {
                    Some(global) => global,
                    None => {
                        // The proxy could not start, so the port is not
                        // actually reachable; don't report it served
                        // until a retry succeeds.
                        served_flag = false;
                        exposure_global.unwrap_or(local)
                    }
                },
                Some(false) => local,
                None => exposure_global.unwrap_or(local),
            };

            let config = self.configs.get(local);
            // An exposure on a stale global port is kept in the model
            // but not shown: annotating with a URL that routes to the
            // wrong global would mislead the UI mid-reassignment.
            let exposed = exposure.filter(|e| e.global_port == global).map(|e| {
                let visibility = if e.public {
                    PortVisibility::Public
                } else {
                    PortVisibility::Private
                };
                ExposedInfo {
                    url: e.url.clone(),
                    visibility,
                    on_exposed: on_exposed_action(config.as_ref(), visibility),
                }
            });

            state.insert(
                local,
                PortStatus {
                    local_port: local,
                    global_port: global,
                    served: served_flag,
                    exposed,
                },
            );
        }
        state
    }

    /// Requests exposures whose target differs from what the control
    /// plane currently reflects. A port qualifies once configuration
    /// declares it or a user process serves it.
    async fn submit_exposures(
        &mut self,
        served: &BTreeMap<u16, bool>,
        new_state: &BTreeMap<u16, PortStatus>,
    ) {
        self.submitted.retain(|port, _| new_state.contains_key(port));

        for (&local, status) in new_state {
            let configured = self.configs.get(local).is_some();
            if !configured && !served.contains_key(&local) {
                continue;
            }
            if served.get(&local) == Some(&true) && self.proxies.global_for(local).is_none() {
                // No reachable global yet; retry once the proxy is up.
                continue;
            }

            let reflected = self
                .exposed_set
                .iter()
                .find(|port| port.local_port == local)
                .map(|port| (port.global_port, port.public));
            let public = match reflected {
                Some((_, public)) => public,
                None => self
                    .configs
                    .get(local)
                    .is_some_and(|c| c.visibility == PortVisibility::Public),
            };
            let target = (status.global_port, public);

            if reflected == Some(target) {
                self.submitted.remove(&local);
                continue;
            }
            if self.submitted.get(&local) == Some(&target) {
                continue;
            }
            match self.exposed.expose(local, target.0, target.1).await {
                Ok(()) => {
                    info!(local, global = target.0, public = target.1, "requested exposure");
                    self.submitted.insert(local, target);
                }
                Err(e) => {
                    warn!(local, global = target.0, error = %e, "exposure request failed");
                    self.submitted.remove(&local);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.proxies.close_all();
        self.hub.finish();
    }
}
