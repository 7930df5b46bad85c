//! Worker port allocation.
//!
//! Ports come from a fixed contiguous range. A port is handed out only if no
//! live instance holds it, it is not already reserved by an in-flight start,
//! and the OS does not report a listener on it.

use super::registry::Registry;
use crate::types::OrchestratorError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// TCP state code for LISTEN in `/proc/net/tcp*`.
const TCP_LISTEN: &str = "0A";

/// Source of truth for which local TCP ports currently have a listener.
pub trait ListenerProbe: Send + Sync {
    /// All ports with a listening socket on any local address.
    fn listening_ports(&self) -> std::io::Result<HashSet<u16>>;
}

/// Reads listening sockets from `/proc/net/tcp` and `/proc/net/tcp6`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcNetListeners;

impl ListenerProbe for ProcNetListeners {
    fn listening_ports(&self) -> std::io::Result<HashSet<u16>> {
        let mut ports = parse_proc_net_tcp(&std::fs::read_to_string("/proc/net/tcp")?);
        // tcp6 is absent when IPv6 is disabled
        if let Ok(v6) = std::fs::read_to_string("/proc/net/tcp6") {
            ports.extend(parse_proc_net_tcp(&v6));
        }
        Ok(ports)
    }
}

/// Extract listening ports from the text of a `/proc/net/tcp*` table.
pub(crate) fn parse_proc_net_tcp(table: &str) -> HashSet<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            if state != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = local.rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

/// Fallback check used when the listener table cannot be read.
fn bind_probe_in_use(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Hands out ports from `[base, base + count)`.
pub(crate) struct PortAllocator {
    base: u16,
    count: u16,
    probe: Arc<dyn ListenerProbe>,
}

impl PortAllocator {
    pub(crate) fn new(base: u16, count: u16, probe: Arc<dyn ListenerProbe>) -> Self {
        Self { base, count, probe }
    }

    fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.count).map_while(|i| self.base.checked_add(i))
    }

    fn exhausted(&self) -> OrchestratorError {
        OrchestratorError::NoPortAvailable {
            base: self.base,
            end: u32::from(self.base) + u32::from(self.count),
        }
    }

    /// Reserve a free port.
    ///
    /// Must be called with the registry lock held: the scan and the insert
    /// into the reservation set happen in the same critical section.
    pub(crate) fn reserve(
        &self,
        registry: &mut Registry,
        exclude: Option<u16>,
    ) -> Result<u16, OrchestratorError> {
        let live = registry.live_ports();
        let os_listeners = match self.probe.listening_ports() {
            Ok(ports) => Some(ports),
            Err(e) => {
                warn!(error = %e, "Listener table unavailable, probing ports by bind");
                None
            }
        };

        for port in self.candidates() {
            if Some(port) == exclude
                || live.contains(&port)
                || registry.reservations.contains(&port)
            {
                continue;
            }

            let in_use = match &os_listeners {
                Some(listeners) => listeners.contains(&port),
                None => bind_probe_in_use(port),
            };
            if in_use {
                warn!(port, "Port is bound by a process outside the manager, skipping");
                continue;
            }

            registry.reservations.insert(port);
            info!(port, "Reserved port");
            return Ok(port);
        }

        warn!(
            base = self.base,
            count = self.count,
            reserved = ?registry.reservations,
            "No free port in range"
        );
        Err(self.exhausted())
    }

    /// Drop a reservation. Safe to call for ports that were never reserved.
    pub(crate) fn release(&self, registry: &mut Registry, port: u16) {
        if registry.reservations.remove(&port) {
            debug!(port, "Released port reservation");
        }
    }
}
