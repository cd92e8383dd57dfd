//! Observation of locally served ports.
//!
//! A *served port* is a TCP port some user process inside the workspace
//! is listening on. [`ProcNetObserver`] discovers them by polling the
//! kernel socket tables (`/proc/net/tcp` and `/proc/net/tcp6`) and
//! emits the complete current set whenever it changes.
//!
//! Scanning both tables matters: modern tooling (Node.js, Vite, Python's
//! `http.server`) often binds `::` by default and would be invisible to
//! an IPv4-only scan. A port bound on several addresses collapses into
//! one entry; it only counts as loopback-bound when *no* binding of it
//! is reachable from other interfaces.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Buffer size of the streams returned by [`ServedPortObserver::observe`].
const CHANNEL_CAPACITY: usize = 32;

/// TCP state code for a listening socket in the kernel tables.
const TCP_LISTEN: u8 = 0x0A;

/// A locally served TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ServedPort {
    /// The bound port number.
    pub port: u16,
    /// True when every binding of this port is on a loopback address,
    /// i.e. the port is unreachable from other interfaces without a
    /// proxy.
    pub bound_to_localhost_only: bool,
}

/// Source of served-port changes.
pub trait ServedPortObserver: Send + 'static {
    /// Starts observation and returns the value and error streams.
    ///
    /// The value stream carries the complete current set of served
    /// ports on every change. Errors are non-fatal; observation
    /// continues after reporting one. Both streams close when the
    /// observer shuts down.
    fn observe(&mut self) -> (mpsc::Receiver<Vec<ServedPort>>, mpsc::Receiver<anyhow::Error>);
}

/// Served-port observer backed by the kernel socket tables.
pub struct ProcNetObserver {
    proc_net_dir: PathBuf,
    poll_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProcNetObserver {
    /// Creates an observer reading from `/proc/net`.
    pub fn new(poll_interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self::with_proc_net_dir("/proc/net", poll_interval, shutdown_rx)
    }

    /// Creates an observer reading the `tcp` and `tcp6` tables from the
    /// given directory.
    pub fn with_proc_net_dir(
        dir: impl Into<PathBuf>,
        poll_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            proc_net_dir: dir.into(),
            poll_interval,
            shutdown_rx,
        }
    }
}

impl ServedPortObserver for ProcNetObserver {
    fn observe(&mut self) -> (mpsc::Receiver<Vec<ServedPort>>, mpsc::Receiver<anyhow::Error>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let dir = self.proc_net_dir.clone();
        let poll_interval = self.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            let mut last: Option<Vec<ServedPort>> = None;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match scan_listening_ports(&dir) {
                            Ok(ports) => {
                                if last.as_ref() == Some(&ports) {
                                    continue;
                                }
                                debug!(count = ports.len(), "served ports changed");
                                if tx.send(ports.clone()).await.is_err() {
                                    return;
                                }
                                last = Some(ports);
                            }
                            Err(e) => {
                                if let Err(mpsc::error::TrySendError::Full(e)) =
                                    err_tx.try_send(anyhow::Error::new(e))
                                {
                                    trace!(error = %e, "dropping scan error, consumer is behind");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("served port observer received shutdown signal");
                            return;
                        }
                    }
                }
            }
        });

        (rx, err_rx)
    }
}

/// Scans the kernel tables for listening TCP sockets.
///
/// Returns one entry per port, sorted ascending. A missing table file
/// counts as empty (IPv6 may be disabled).
fn scan_listening_ports(dir: &Path) -> std::io::Result<Vec<ServedPort>> {
    let mut bindings = Vec::new();
    for (file, ipv6) in [("tcp", false), ("tcp6", true)] {
        match fs::read_to_string(dir.join(file)) {
            Ok(content) => bindings.extend(parse_net_tcp(&content, ipv6)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    // Collapse per-address bindings into per-port entries. Any
    // non-loopback binding makes the port reachable without a proxy.
    let mut ports: BTreeMap<u16, bool> = BTreeMap::new();
    for (port, addr) in bindings {
        let local_only = ports.entry(port).or_insert(true);
        *local_only = *local_only && is_loopback(&addr);
    }

    Ok(ports
        .into_iter()
        .map(|(port, bound_to_localhost_only)| ServedPort {
            port,
            bound_to_localhost_only,
        })
        .collect())
}

fn is_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => a.is_loopback(),
        IpAddr::V6(a) => {
            a.is_loopback() || a.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

/// Parses one kernel socket table, keeping listening sockets only.
///
/// Each line after the header looks like:
/// ```text
///    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12346 ...
/// ```
/// Malformed lines are skipped; the kernel writes this file, so a bad
/// line means a format we don't know, not corrupt input worth failing
/// the scan over.
fn parse_net_tcp(content: &str, ipv6: bool) -> Vec<(u16, IpAddr)> {
    let mut sockets = Vec::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let Ok(state) = u8::from_str_radix(parts[3], 16) else {
            trace!(line, "skipping unparseable socket state");
            continue;
        };
        if state != TCP_LISTEN {
            continue;
        }
        let parsed = if ipv6 {
            parse_hex_addr_v6(parts[1])
        } else {
            parse_hex_addr_v4(parts[1])
        };
        match parsed {
            Some((addr, port)) => sockets.push((port, addr)),
            None => trace!(line, "skipping unparseable socket address"),
        }
    }
    sockets
}

/// Parses a hex `address:port` pair from the IPv4 table.
///
/// The address is stored in host byte order, so `0100007F:1F90` is
/// `127.0.0.1:8080`.
fn parse_hex_addr_v4(s: &str) -> Option<(IpAddr, u16)> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let addr = u32::from_str_radix(addr_hex, 16).ok()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some((IpAddr::V4(Ipv4Addr::from(addr.swap_bytes())), port))
}

/// Parses a hex `address:port` pair from the IPv6 table.
///
/// The address is stored as four little-endian 32-bit words.
fn parse_hex_addr_v6(s: &str) -> Option<(IpAddr, u16)> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    if addr_hex.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for i in 0..4 {
        let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).ok()?;
        octets[i * 4..(i + 1) * 4].copy_from_slice(&word.to_le_bytes());
    }
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some((IpAddr::V6(Ipv6Addr::from(octets)), port))
}
