//! Host port allocation
//!
//! The allocator owns the only state shared between pipelines: the set of
//! reserved host ports. Every acquisition reconciles that set against the
//! ports the container runtime reports as published, then scans the range in
//! ascending order and probes each candidate over TCP before reserving it.
//! The whole sequence runs under one async mutex, so concurrent callers never
//! receive the same port.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::deploy::docker::ContainerRuntime;
use crate::errors::EngineError;

/// Holder recorded for ports found bound by containers the allocator did not hand out
pub const OBSERVED_HOLDER: &str = "observed";

/// Half-open range of host ports, `start..end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, EngineError> {
        if start == 0 || start >= end {
            return Err(EngineError::ConfigError(format!(
                "Invalid port range {}..{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 3000,
            end: 4000,
        }
    }
}

/// A port held on behalf of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReservation {
    pub port: u16,
    pub holder: String,
    pub reserved_at: DateTime<Utc>,
    /// Set once a container has been seen serving the port
    pub confirmed: bool,
}

/// Liveness probe for a host port
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// True if something currently accepts connections on `port`
    async fn is_listening(&self, port: u16) -> bool;
}

/// Probe that attempts a TCP connect on the loopback interface
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new("127.0.0.1", Duration::from_millis(250))
    }
}

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_listening(&self, port: u16) -> bool {
        let addr: SocketAddr = match format!("{}:{}", self.host, port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid probe address {}:{}: {}", self.host, port, e);
                return false;
            }
        };
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Allocator options
#[derive(Debug, Clone)]
pub struct Options {
    pub range: PortRange,

    /// Unconfirmed reservations older than this are dropped during
    /// reconciliation unless a container is seen on the port
    pub reservation_ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            range: PortRange::default(),
            reservation_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Lock-guarded pool of host ports
pub struct PortAllocator {
    options: Options,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn PortProbe>,
    reservations: Mutex<HashMap<u16, PortReservation>>,
}

impl PortAllocator {
    pub fn new(
        options: Options,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            options,
            runtime,
            probe,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.options.range
    }

    /// Reserve the lowest free port in range for `holder`
    pub async fn acquire(&self, holder: &str) -> Result<u16, EngineError> {
        let mut reservations = self.reservations.lock().await;

        let observed = match self.runtime.published_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Unable to list container ports, relying on probes: {}", e);
                HashSet::new()
            }
        };
        self.reconcile(&mut reservations, &observed, Utc::now());

        for port in self.options.range.iter() {
            if observed.contains(&port) || reservations.contains_key(&port) {
                continue;
            }
            if self.probe.is_listening(port).await {
                debug!("Port {} is in use outside the tracked inventory", port);
                continue;
            }

            reservations.insert(
                port,
                PortReservation {
                    port,
                    holder: holder.to_string(),
                    reserved_at: Utc::now(),
                    confirmed: false,
                },
            );
            info!("Reserved port {} for {}", port, holder);
            return Ok(port);
        }

        Err(EngineError::ResourceExhausted {
            start: self.options.range.start,
            end: self.options.range.end,
        })
    }

    /// Mark a reservation as backing a running container
    pub async fn confirm(&self, port: u16) {
        let mut reservations = self.reservations.lock().await;
        if let Some(reservation) = reservations.get_mut(&port) {
            reservation.confirmed = true;
        }
    }

    /// Release a port. Releasing a port that is not reserved is a no-op.
    pub async fn release(&self, port: u16) -> bool {
        let mut reservations = self.reservations.lock().await;
        let released = reservations.remove(&port).is_some();
        if released {
            info!("Released port {}", port);
        } else {
            debug!("Port {} was not reserved", port);
        }
        released
    }

    /// Snapshot of current reservations, ordered by port
    pub async fn reserved(&self) -> Vec<PortReservation> {
        let reservations = self.reservations.lock().await;
        let mut snapshot: Vec<_> = reservations.values().cloned().collect();
        snapshot.sort_by_key(|r| r.port);
        snapshot
    }

    fn reconcile(
        &self,
        reservations: &mut HashMap<u16, PortReservation>,
        observed: &HashSet<u16>,
        now: DateTime<Utc>,
    ) {
        for &port in observed.iter().filter(|p| self.options.range.contains(**p)) {
            reservations
                .entry(port)
                .and_modify(|r| r.confirmed = true)
                .or_insert_with(|| PortReservation {
                    port,
                    holder: OBSERVED_HOLDER.to_string(),
                    reserved_at: now,
                    confirmed: true,
                });
        }

        let ttl = chrono::Duration::from_std(self.options.reservation_ttl)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        reservations.retain(|port, r| {
            let expired = !r.confirmed && now - r.reserved_at >= ttl;
            if expired {
                warn!(
                    "Dropping stale reservation of port {} held by {} since {}",
                    port, r.holder, r.reserved_at
                );
            }
            !expired
        });
    }
}
