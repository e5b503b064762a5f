use crate::model::Reading;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Last-known-good snapshot for one meter.
///
/// The reading is behind an `Arc` so handing it to consumers is a cheap
/// clone; the record itself is only ever replaced wholesale.
#[derive(Debug, Clone)]
pub struct CachedReading {
    pub reading: Arc<Reading>,
    pub updated_at: Instant,
    /// Set when the last attempted fetch for this meter failed; the prior
    /// value is retained so dashboards do not flap on brief hiccups.
    pub stale: bool,
    pub failures_since_update: u32,
}

impl CachedReading {
    /// A sustained outage eventually makes the value unavailable.
    pub fn is_available(&self, failure_threshold: u32) -> bool {
        self.failures_since_update < failure_threshold
    }
}

/// Last-known-good readings per meter serial, with atomic full replacement.
#[derive(Default)]
pub struct ReadingCache {
    entries: RwLock<HashMap<String, CachedReading>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, serial: &str) -> Option<CachedReading> {
        self.entries.read().await.get(serial).cloned()
    }

    /// Replaces the whole entry for a meter with a fresh reading, clearing
    /// staleness and the failure counter. Readers never observe a
    /// half-written record.
    pub async fn put(&self, serial: &str, reading: Reading) {
        let entry = CachedReading {
            reading: Arc::new(reading),
            updated_at: Instant::now(),
            stale: false,
            failures_since_update: 0,
        };
        self.entries.write().await.insert(serial.to_string(), entry);
    }

    /// Flags the cached value as stale after a failed fetch, keeping the
    /// value itself. No-op for meters that never produced a reading.
    pub async fn mark_stale(&self, serial: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(serial) {
            entry.stale = true;
            entry.failures_since_update += 1;
        }
    }

    /// Drops a meter's entry; called when the catalog drops the device.
    pub async fn evict(&self, serial: &str) {
        self.entries.write().await.remove(serial);
    }

    pub async fn serials(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn reading(serial: &str, energy: f64) -> Reading {
        Reading {
            device_serial: serial.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            active_energy_total: energy,
            active_energy_t1: None,
            active_energy_t2: None,
            active_energy_t3: None,
            voltage: 230.0,
            current: 5.0,
            power_factor: None,
            wifi_mac: "00:aa:bb:cc:dd:ee".to_string(),
            wifi_signal_strength: Some(15),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = ReadingCache::new();
        cache.put("M1", reading("M1", 100.0)).await;

        let cached = cache.get("M1").await.unwrap();
        assert_eq!(cached.reading.active_energy_total, 100.0);
        assert!(!cached.stale);
        assert_eq!(cached.failures_since_update, 0);
        assert!(cache.get("M2").await.is_none());
    }

    #[tokio::test]
    async fn test_mark_stale_retains_value() {
        let cache = ReadingCache::new();
        cache.put("M1", reading("M1", 100.0)).await;
        cache.mark_stale("M1").await;

        let cached = cache.get("M1").await.unwrap();
        assert!(cached.stale);
        assert_eq!(cached.failures_since_update, 1);
        assert_eq!(cached.reading.active_energy_total, 100.0);
    }

    #[tokio::test]
    async fn test_put_clears_staleness_and_failures() {
        let cache = ReadingCache::new();
        cache.put("M1", reading("M1", 100.0)).await;
        cache.mark_stale("M1").await;
        cache.mark_stale("M1").await;

        cache.put("M1", reading("M1", 101.5)).await;
        let cached = cache.get("M1").await.unwrap();
        assert!(!cached.stale);
        assert_eq!(cached.failures_since_update, 0);
        assert_eq!(cached.reading.active_energy_total, 101.5);
    }

    #[tokio::test]
    async fn test_availability_threshold() {
        let cache = ReadingCache::new();
        cache.put("M1", reading("M1", 100.0)).await;

        for _ in 0..2 {
            cache.mark_stale("M1").await;
        }
        assert!(cache.get("M1").await.unwrap().is_available(3));

        cache.mark_stale("M1").await;
        assert!(!cache.get("M1").await.unwrap().is_available(3));
    }

    #[tokio::test]
    async fn test_mark_stale_without_entry_is_noop() {
        let cache = ReadingCache::new();
        cache.mark_stale("M1").await;
        assert!(cache.get("M1").await.is_none());
    }

    #[tokio::test]
    async fn test_evict() {
        let cache = ReadingCache::new();
        cache.put("M1", reading("M1", 100.0)).await;
        cache.put("M2", reading("M2", 200.0)).await;

        cache.evict("M1").await;
        assert!(cache.get("M1").await.is_none());
        assert_eq!(cache.len().await, 1);
    }
}
