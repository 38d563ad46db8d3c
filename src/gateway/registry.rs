use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use super::packets::ProtocolVersion;
use crate::eui::Eui64;

/// Where a datagram from a gateway was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub addr: SocketAddr,
    pub version: ProtocolVersion,
    /// Keepalive pulls come from the socket the gateway listens on for downlinks.
    pub pull: bool,
}

impl Sighting {
    pub fn push(addr: SocketAddr, version: ProtocolVersion) -> Self {
        Self { addr, version, pull: false }
    }

    pub fn pull(addr: SocketAddr, version: ProtocolVersion) -> Self {
        Self { addr, version, pull: true }
    }
}

/// Resolved downlink destination for a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub version: ProtocolVersion,
}

#[derive(Debug)]
struct Registration {
    addr: SocketAddr,
    pull_addr: Option<SocketAddr>,
    version: ProtocolVersion,
    last_seen: Instant,
    pending: HashMap<u16, Instant>,
}

/// Last-known network location and liveness of every gateway that talked to us.
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    gateways: Mutex<HashMap<Eui64, Registration>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Eui64, Registration>> {
        self.gateways.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a frame from `gateway`. Returns true when the gateway was not
    /// registered before.
    pub fn touch(&self, gateway: Eui64, sighting: Sighting, now: Instant) -> bool {
        let mut gateways = self.lock();
        match gateways.get_mut(&gateway) {
            Some(registration) => {
                registration.addr = sighting.addr;
                registration.version = sighting.version;
                registration.last_seen = now;
                if sighting.pull {
                    registration.pull_addr = Some(sighting.addr);
                }
                false
            }
            None => {
                gateways.insert(
                    gateway,
                    Registration {
                        addr: sighting.addr,
                        pull_addr: sighting.pull.then_some(sighting.addr),
                        version: sighting.version,
                        last_seen: now,
                        pending: HashMap::new(),
                    },
                );
                true
            }
        }
    }

    pub fn resolve(&self, gateway: Eui64) -> Option<Endpoint> {
        self.lock().get(&gateway).map(|r| Endpoint {
            addr: r.pull_addr.unwrap_or(r.addr),
            version: r.version,
        })
    }

    pub fn contains(&self, gateway: Eui64) -> bool {
        self.lock().contains_key(&gateway)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remembers a downlink token awaiting its transmit acknowledgment.
    pub fn track_token(&self, gateway: Eui64, token: u16, now: Instant) {
        if let Some(registration) = self.lock().get_mut(&gateway) {
            registration.pending.insert(token, now);
        }
    }

    /// Clears an outstanding token. Returns false when nothing was waiting on it.
    pub fn acknowledge(&self, gateway: Eui64, token: u16) -> bool {
        self.lock()
            .get_mut(&gateway)
            .is_some_and(|r| r.pending.remove(&token).is_some())
    }

    pub fn pending_tokens(&self, gateway: Eui64) -> usize {
        self.lock().get(&gateway).map_or(0, |r| r.pending.len())
    }

    /// Evicts gateways not seen for longer than `timeout` and expires
    /// outstanding tokens of the same age. Returns the evicted identifiers.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<Eui64> {
        let expired = |at: Instant| now.saturating_duration_since(at) > timeout;

        let mut gateways = self.lock();
        let evicted: Vec<Eui64> = gateways
            .iter()
            .filter(|(_, r)| expired(r.last_seen))
            .map(|(gateway, _)| *gateway)
            .collect();
        for gateway in &evicted {
            gateways.remove(gateway);
        }
        for registration in gateways.values_mut() {
            registration.pending.retain(|_, sent| !expired(*sent));
        }
        evicted
    }
}
