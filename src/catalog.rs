use crate::model::Device;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A device absent from this many consecutive discovery passes is dropped.
/// One missed pass is tolerated because the API occasionally omits meters.
const DISCOVERY_MISS_LIMIT: u32 = 2;

struct CatalogEntry {
    device: Device,
    /// Consecutive discovery passes this device was absent from.
    missed: u32,
}

/// What one discovery pass changed, for the coordinator to act on.
/// Evictions must cascade to the reading cache; the catalog itself holds
/// no reference to it.
#[derive(Debug, Default)]
pub struct DiscoveryDelta {
    pub added: Vec<Device>,
    pub evicted: Vec<String>,
}

/// Per-account cache of discovered meters, keyed by serial number.
#[derive(Default)]
pub struct DeviceCatalog {
    inner: RwLock<CatalogState>,
}

#[derive(Default)]
struct CatalogState {
    entries: HashMap<String, CatalogEntry>,
    last_discovery: Option<Instant>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one discovery pass into the catalog.
    ///
    /// Newly seen serials are added, known serials get their miss counter
    /// reset, and serials absent from this pass accrue a miss. A device
    /// missing for `DISCOVERY_MISS_LIMIT` consecutive passes is dropped
    /// and reported in the delta so its cache entry can be invalidated.
    pub async fn apply_discovery(&self, seen: Vec<Device>) -> DiscoveryDelta {
        let mut state = self.inner.write().await;
        let mut delta = DiscoveryDelta::default();

        let seen_serials: Vec<String> = seen.iter().map(|d| d.serial_number.clone()).collect();

        for device in seen {
            match state.entries.get_mut(&device.serial_number) {
                Some(entry) => {
                    entry.missed = 0;
                    if entry.device != device {
                        // Static attributes changed remotely: replace the
                        // whole entry rather than patching fields.
                        warn!(
                            serial = %device.serial_number,
                            "Meter attributes changed on the cloud service, adopting new ones"
                        );
                        entry.device = device;
                    }
                }
                None => {
                    debug!(serial = %device.serial_number, "Discovered new meter");
                    state.entries.insert(
                        device.serial_number.clone(),
                        CatalogEntry {
                            device: device.clone(),
                            missed: 0,
                        },
                    );
                    delta.added.push(device);
                }
            }
        }

        let mut dropped = Vec::new();
        for (serial, entry) in state.entries.iter_mut() {
            if seen_serials.iter().any(|s| s == serial) {
                continue;
            }
            entry.missed += 1;
            if entry.missed >= DISCOVERY_MISS_LIMIT {
                dropped.push(serial.clone());
            } else {
                debug!(
                    serial = %serial,
                    missed = entry.missed,
                    "Meter absent from discovery pass, keeping for now"
                );
            }
        }
        for serial in dropped {
            warn!(serial = %serial, "Meter gone from consecutive discovery passes, dropping");
            state.entries.remove(&serial);
            delta.evicted.push(serial);
        }

        state.last_discovery = Some(Instant::now());
        delta
    }

    /// Removes a device immediately (the remote positively reported it
    /// gone with a not-found response).
    pub async fn remove(&self, serial: &str) -> bool {
        self.inner.write().await.entries.remove(serial).is_some()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.inner
            .read()
            .await
            .entries
            .values()
            .map(|e| e.device.clone())
            .collect()
    }

    pub async fn serials(&self) -> Vec<String> {
        self.inner.read().await.entries.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// True when the catalog has never been filled or the last discovery
    /// pass is older than `max_age`.
    pub async fn needs_discovery(&self, max_age: Duration) -> bool {
        let state = self.inner.read().await;
        if state.entries.is_empty() {
            return true;
        }
        match state.last_discovery {
            Some(at) => at.elapsed() >= max_age,
            None => true,
        }
    }
}
