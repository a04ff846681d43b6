use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::models::{BusStatus, DriverLocationSample};

/// Latest driver-reported state for one running operation, plus the snapshot
/// needed to build a broadcast payload without touching the database.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub sample: DriverLocationSample,
    pub organization_id: String,
    pub bus_number: String,
    pub route_name: Option<String>,
    pub driver_name: Option<String>,
    pub total_seats: i64,
    pub current_station_name: Option<String>,
    /// Server-side write instant, used for the staleness sweep.
    pub(crate) received_at: Instant,
}

impl CacheEntry {
    pub fn to_status(&self) -> BusStatus {
        BusStatus {
            operation_id: self.sample.operation_id.clone(),
            bus_number: self.bus_number.clone(),
            route_name: self.route_name.clone(),
            organization_id: self.organization_id.clone(),
            latitude: self.sample.latitude,
            longitude: self.sample.longitude,
            total_seats: self.total_seats,
            current_passengers: self.sample.current_passengers,
            available_seats: self.total_seats - self.sample.current_passengers,
            current_station_name: self.current_station_name.clone(),
            driver_name: self.driver_name.clone(),
            last_update_time: self.sample.timestamp,
            is_active: true,
        }
    }
}

/// Last-known driver position per running operation. Last-write-wins: an
/// out-of-order sample may briefly overwrite a newer one, which self-corrects
/// on the next cycle.
#[derive(Default)]
pub struct LocationCache {
    entries: DashMap<String, CacheEntry>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.entries.insert(entry.sample.operation_id.clone(), entry);
    }

    pub fn get(&self, operation_id: &str) -> Option<CacheEntry> {
        self.entries.get(operation_id).map(|e| e.clone())
    }

    /// Explicit removal, called on operation end. Returns whether an entry
    /// was present.
    pub fn evict(&self, operation_id: &str) -> bool {
        self.entries.remove(operation_id).is_some()
    }

    pub fn entries_for_organization(&self, organization_id: &str) -> Vec<CacheEntry> {
        self.entries
            .iter()
            .filter(|e| e.organization_id == organization_id)
            .map(|e| e.clone())
            .collect()
    }

    /// Reconciles the cached passenger count after a boarding/alighting
    /// mutation so broadcasts built before the next driver sample are not
    /// stale.
    pub fn update_passenger_count(&self, operation_id: &str, count: i64) {
        if let Some(mut entry) = self.entries.get_mut(operation_id) {
            entry.sample.current_passengers = count;
        }
    }

    /// Removes entries whose last write is older than `ttl` (driver app
    /// presumed disconnected). Returns the evicted operation ids.
    pub fn evict_stale(&self, ttl: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.entries.retain(|operation_id, entry| {
            if entry.received_at.elapsed() > ttl {
                evicted.push(operation_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(operation_id: &str, organization_id: &str, passengers: i64) -> CacheEntry {
        CacheEntry {
            sample: DriverLocationSample {
                operation_id: operation_id.to_string(),
                latitude: 37.5665,
                longitude: 126.9780,
                current_passengers: passengers,
                timestamp: 1_700_000_000_000,
            },
            organization_id: organization_id.to_string(),
            bus_number: "1001".into(),
            route_name: Some("Campus Loop".into()),
            driver_name: Some("Kim".into()),
            total_seats: 40,
            current_station_name: None,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn last_write_wins() {
        let cache = LocationCache::new();
        cache.insert(entry("op-1", "org-1", 3));
        cache.insert(entry("op-1", "org-1", 7));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("op-1").unwrap().sample.current_passengers, 7);
    }

    #[test]
    fn evict_removes_entry() {
        let cache = LocationCache::new();
        cache.insert(entry("op-1", "org-1", 0));
        assert!(cache.evict("op-1"));
        assert!(!cache.evict("op-1"));
        assert!(cache.get("op-1").is_none());
    }

    #[test]
    fn entries_are_scoped_by_organization() {
        let cache = LocationCache::new();
        cache.insert(entry("op-1", "org-1", 0));
        cache.insert(entry("op-2", "org-1", 0));
        cache.insert(entry("op-3", "org-2", 0));

        let org1 = cache.entries_for_organization("org-1");
        assert_eq!(org1.len(), 2);
        assert!(cache.entries_for_organization("org-3").is_empty());
    }

    #[test]
    fn stale_entries_are_swept() {
        let cache = LocationCache::new();
        cache.insert(entry("op-old", "org-1", 0));
        std::thread::sleep(Duration::from_millis(30));
        cache.insert(entry("op-new", "org-1", 0));

        let evicted = cache.evict_stale(Duration::from_millis(20));
        assert_eq!(evicted, vec!["op-old".to_string()]);
        assert!(cache.get("op-old").is_none());
        assert!(cache.get("op-new").is_some());
    }

    #[test]
    fn status_derives_available_seats() {
        let cache = LocationCache::new();
        cache.insert(entry("op-1", "org-1", 12));
        cache.update_passenger_count("op-1", 13);

        let status = cache.get("op-1").unwrap().to_status();
        assert_eq!(status.current_passengers, 13);
        assert_eq!(status.available_seats, 27);
        assert!(status.is_active);
    }
}
