pub mod cache;
pub mod detection;
pub mod sessions;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::TrackingConfig;
use crate::error::TrackingError;
use crate::geo;
use crate::lifecycle::{EndRequest, OperationLifecycle, StartRequest};
use crate::models::{
    BoardingAction, BoardingDetectionResult, BusStatus, DriverLocationSample, OperationSnapshot,
    OperationStatus, RouteStation,
};
use crate::store::Store;

use cache::{CacheEntry, LocationCache};
use detection::{BusCandidate, Decision, DetectionEngine};
use sessions::SessionRegistry;

/// Nearest route station within `radius_m`, searching a small window around
/// the previously observed station rather than the whole route.
fn nearest_station<'a>(
    stations: &'a [RouteStation],
    prev_index: i64,
    latitude: f64,
    longitude: f64,
    radius_m: f64,
) -> Option<&'a RouteStation> {
    if stations.is_empty() {
        return None;
    }
    let end = (((prev_index + 3).max(0)) as usize).min(stations.len());
    let start = ((prev_index - 1).max(0) as usize).min(end);

    let mut nearest = None;
    let mut min_distance = radius_m;
    for station in &stations[start..end] {
        let distance = geo::distance_meters(latitude, longitude, station.lat, station.lon);
        if distance < min_distance {
            min_distance = distance;
            nearest = Some(station);
        }
    }
    nearest
}

fn detection_result(
    user_id: &str,
    operation_id: &str,
    bus_number: &str,
    action: BoardingAction,
    auto_detected: bool,
    distance: f64,
    successful: bool,
    message: &str,
) -> BoardingDetectionResult {
    BoardingDetectionResult {
        user_id: user_id.to_string(),
        operation_id: operation_id.to_string(),
        bus_number: bus_number.to_string(),
        action,
        auto_detected,
        detection_distance: distance,
        timestamp: Utc::now().timestamp_millis(),
        successful,
        message: message.to_string(),
    }
}

/// Front door of the real-time tracking core. Owns the live-location cache,
/// the passenger detection engine and the session registry, routes every
/// mutation through the operation lifecycle, and runs the maintenance
/// sweeps on the same paths the interactive API uses.
pub struct TrackingManager {
    store: Store,
    lifecycle: OperationLifecycle,
    cache: LocationCache,
    detection: DetectionEngine,
    sessions: SessionRegistry,
    config: TrackingConfig,
}

impl TrackingManager {
    pub fn new(store: Store, config: TrackingConfig) -> Self {
        let lifecycle = OperationLifecycle::new(store.clone(), config.clone());
        let detection = DetectionEngine::new(&config);
        Self {
            store,
            lifecycle,
            cache: LocationCache::new(),
            detection,
            sessions: SessionRegistry::new(),
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn lifecycle(&self) -> &OperationLifecycle {
        &self.lifecycle
    }

    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn detection(&self) -> &DetectionEngine {
        &self.detection
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Starts the background sweep loops; runs until the process exits.
    pub async fn start(self: Arc<Self>) {
        info!("Starting tracking manager");

        let sweep_self = self.clone();
        let cache_interval = Duration::from_secs(self.config.cache_sweep_interval_secs);
        let cache_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache_interval);
            // Skip the first tick which fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                sweep_self.run_cache_sweep();
            }
        });

        let close_self = self.clone();
        let close_interval = Duration::from_secs(self.config.autoclose_sweep_interval_secs);
        let close_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(close_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                close_self.run_autoclose_sweep_at(Utc::now()).await;
            }
        });

        let _ = tokio::join!(cache_handle, close_handle);
    }

    /// Ingests one driver GPS sample. Returns false (no mutation, no
    /// broadcast) when the referenced operation is not in progress.
    pub async fn ingest_driver_location(
        &self,
        sample: DriverLocationSample,
    ) -> Result<bool, TrackingError> {
        let op = match self.store.operation(&sample.operation_id).await {
            Ok(op) => op,
            Err(TrackingError::NotFound(_)) => {
                warn!(operation = %sample.operation_id, "Location update for unknown operation");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if op.status != OperationStatus::InProgress {
            warn!(
                operation = %op.id,
                status = op.status.as_str(),
                "Location update for operation that is not in progress"
            );
            return Ok(false);
        }

        let bus = self.store.bus(&op.bus_id).await?;
        let passengers = sample.current_passengers.clamp(0, bus.total_seats);

        // Nearest-station progress along the route.
        let stations = self.store.route_stations(&op.route_id).await?;
        let at_station = nearest_station(
            &stations,
            bus.prev_station_index,
            sample.latitude,
            sample.longitude,
            self.config.station_radius_m,
        );
        let advanced = at_station.filter(|s| s.sequence != bus.prev_station_index);
        let current_station_name = at_station
            .map(|s| s.name.clone())
            .or_else(|| {
                stations
                    .iter()
                    .find(|s| s.sequence == bus.prev_station_index)
                    .map(|s| s.name.clone())
            });

        self.store
            .apply_driver_sample(
                &op.id,
                &bus.id,
                sample.latitude,
                sample.longitude,
                passengers,
                advanced,
                Utc::now(),
            )
            .await?;
        if let Some(station) = advanced {
            info!(operation = %op.id, station = %station.name, sequence = station.sequence, "Bus reached station");
        }

        let driver_name = self.store.driver(&op.driver_id).await.ok().map(|d| d.name);
        let route_name = self.store.route_name(&op.route_id).await?;
        let entry = CacheEntry {
            sample: DriverLocationSample {
                current_passengers: passengers,
                ..sample
            },
            organization_id: op.organization_id.clone(),
            bus_number: bus.bus_number.clone(),
            route_name,
            driver_name,
            total_seats: bus.total_seats,
            current_station_name,
            received_at: Instant::now(),
        };
        let status = entry.to_status();
        self.cache.insert(entry);

        // Fire-and-forget: a failed send never rolls back the mutation.
        let delivered = self.sessions.broadcast_bus_update(&op.organization_id, &status);
        debug!(operation = %op.id, delivered, "Broadcast bus update");
        Ok(true)
    }

    /// Feeds one passenger GPS sample through the detection engine and
    /// commits any debounced transition through the lifecycle manager.
    /// Returns the detection result when a transition was attempted.
    pub async fn process_passenger_location(
        &self,
        organization_id: &str,
        user_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<BoardingDetectionResult>, TrackingError> {
        let entries = self.cache.entries_for_organization(organization_id);
        let candidates: Vec<BusCandidate> = entries
            .iter()
            .map(|e| BusCandidate {
                operation_id: e.sample.operation_id.clone(),
                latitude: e.sample.latitude,
                longitude: e.sample.longitude,
            })
            .collect();

        let bus_number_of = |operation_id: &str| {
            entries
                .iter()
                .find(|e| e.sample.operation_id == operation_id)
                .map(|e| e.bus_number.clone())
                .unwrap_or_default()
        };

        let decision =
            self.detection
                .observe(user_id, organization_id, latitude, longitude, &candidates);
        match decision {
            Decision::None => Ok(None),
            Decision::TryBoard {
                operation_id,
                distance,
            } => {
                let bus_number = bus_number_of(&operation_id);
                match self.lifecycle.adjust_passenger_count(&operation_id, 1).await {
                    Ok(count) => {
                        self.detection.commit_board(user_id, &operation_id);
                        self.refresh_count_and_broadcast(&operation_id, organization_id, count);
                        Ok(Some(detection_result(
                            user_id,
                            &operation_id,
                            &bus_number,
                            BoardingAction::Board,
                            true,
                            distance,
                            true,
                            "boarding detected",
                        )))
                    }
                    Err(TrackingError::Capacity(_)) => {
                        // Bus full: stay off-bus, allow re-detection next
                        // cycle in case a seat frees.
                        self.detection.board_rejected(user_id);
                        Ok(Some(detection_result(
                            user_id,
                            &operation_id,
                            &bus_number,
                            BoardingAction::Board,
                            true,
                            distance,
                            false,
                            "bus is full",
                        )))
                    }
                    Err(TrackingError::WrongState(_)) | Err(TrackingError::NotFound(_)) => {
                        // Operation ended between the cache read and the commit.
                        self.detection.board_rejected(user_id);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Decision::TryAlight {
                operation_id,
                distance,
            } => {
                let bus_number = bus_number_of(&operation_id);
                match self
                    .lifecycle
                    .adjust_passenger_count(&operation_id, -1)
                    .await
                {
                    Ok(count) => {
                        self.detection.commit_alight(user_id);
                        self.refresh_count_and_broadcast(&operation_id, organization_id, count);
                        Ok(Some(detection_result(
                            user_id,
                            &operation_id,
                            &bus_number,
                            BoardingAction::Alight,
                            true,
                            distance,
                            true,
                            "alighting detected",
                        )))
                    }
                    Err(TrackingError::WrongState(_)) | Err(TrackingError::NotFound(_)) => {
                        // The ride is over regardless; self-heal the state.
                        self.detection.commit_alight(user_id);
                        Ok(Some(detection_result(
                            user_id,
                            &operation_id,
                            &bus_number,
                            BoardingAction::Alight,
                            true,
                            distance,
                            true,
                            "operation already ended",
                        )))
                    }
                    Err(TrackingError::Capacity(_)) => {
                        self.detection.alight_rejected(user_id);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Decision::ForceAlight { operation_id } => {
                self.detection.commit_alight(user_id);
                let bus_number = match self.store.operation(&operation_id).await {
                    Ok(op) => self
                        .store
                        .bus(&op.bus_id)
                        .await
                        .map(|b| b.bus_number)
                        .unwrap_or_default(),
                    Err(_) => String::new(),
                };
                info!(user = user_id, operation = %operation_id, "Forced alight, operation no longer running");
                Ok(Some(detection_result(
                    user_id,
                    &operation_id,
                    &bus_number,
                    BoardingAction::Alight,
                    true,
                    0.0,
                    true,
                    "ride ended",
                )))
            }
        }
    }

    /// Manual board/alight. Resolves the operation by bus number, goes
    /// through the same count mutation as auto-detection, and forces the
    /// passenger state transition past the debounce.
    pub async fn manual_boarding(
        &self,
        organization_id: &str,
        user_id: &str,
        bus_number: &str,
        action: BoardingAction,
    ) -> Result<BoardingDetectionResult, TrackingError> {
        let bus = self.store.bus_by_number(organization_id, bus_number).await?;
        let op = self
            .store
            .in_progress_operation_for_bus(&bus.id)
            .await?
            .ok_or_else(|| {
                TrackingError::WrongState(format!("bus {bus_number} is not on an active operation"))
            })?;

        let delta = match action {
            BoardingAction::Board => 1,
            BoardingAction::Alight => -1,
        };
        let count = self.lifecycle.adjust_passenger_count(&op.id, delta).await?;
        match action {
            BoardingAction::Board => self.detection.force_board(user_id, organization_id, &op.id),
            BoardingAction::Alight => self.detection.force_alight(user_id),
        }
        self.refresh_count_and_broadcast(&op.id, organization_id, count);

        info!(user = user_id, bus = bus_number, action = ?action, "Manual boarding action applied");
        let message = match action {
            BoardingAction::Board => "boarded",
            BoardingAction::Alight => "alighted",
        };
        Ok(detection_result(
            user_id, &op.id, bus_number, action, false, 0.0, true, message,
        ))
    }

    pub async fn start_operation(
        &self,
        req: &StartRequest,
    ) -> Result<OperationSnapshot, TrackingError> {
        self.lifecycle.start_operation(req).await
    }

    pub async fn end_operation(
        &self,
        req: &EndRequest,
    ) -> Result<OperationSnapshot, TrackingError> {
        let snapshot = self.lifecycle.end_operation(req).await?;
        self.cache.evict(&req.operation_id);
        Ok(snapshot)
    }

    /// Administrative status transition; evicts the live cache entry when
    /// the operation reaches a terminal status.
    pub async fn update_status(
        &self,
        operation_id: &str,
        new_status: OperationStatus,
        passenger_hint: Option<i64>,
        stops_hint: Option<i64>,
    ) -> Result<(), TrackingError> {
        self.lifecycle
            .update_status(operation_id, new_status, passenger_hint, stops_hint)
            .await?;
        if new_status.is_terminal() {
            self.cache.evict(operation_id);
        }
        Ok(())
    }

    /// Live statuses for every tracked bus in the organization.
    pub fn organization_statuses(&self, organization_id: &str) -> Vec<BusStatus> {
        self.cache
            .entries_for_organization(organization_id)
            .iter()
            .map(CacheEntry::to_status)
            .collect()
    }

    fn refresh_count_and_broadcast(&self, operation_id: &str, organization_id: &str, count: i64) {
        self.cache.update_passenger_count(operation_id, count);
        if let Some(entry) = self.cache.get(operation_id) {
            let status = entry.to_status();
            self.sessions.broadcast_bus_update(organization_id, &status);
            self.sessions.send_seat_update(operation_id, &status);
        }
    }

    /// Expires stale location entries and idle passenger states.
    pub fn run_cache_sweep(&self) {
        let evicted = self
            .cache
            .evict_stale(Duration::from_secs(self.config.location_ttl_secs));
        for operation_id in &evicted {
            info!(operation = %operation_id, "Evicted stale location entry");
        }
        let idle = self
            .detection
            .evict_idle(Duration::from_secs(self.config.passenger_idle_ttl_secs));
        if !evicted.is_empty() || idle > 0 {
            info!(locations = evicted.len(), passengers = idle, "Cache sweep finished");
        }
    }

    /// Force-closes abandoned operations and evicts their cache entries.
    pub(crate) async fn run_autoclose_sweep_at(&self, now: DateTime<Utc>) {
        match self.lifecycle.auto_close_abandoned(now).await {
            Ok(closed) => {
                for operation_id in &closed {
                    self.cache.evict(operation_id);
                }
                if !closed.is_empty() {
                    info!(closed = closed.len(), "Auto-close sweep finished");
                }
            }
            Err(e) => warn!(error = %e, "Auto-close sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{memory_store, seed_basic, SeedIds};
    use crate::store::NewOperation;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const ORIGIN_LAT: f64 = 37.5665;
    const ORIGIN_LON: f64 = 126.9780;
    const LIBRARY_LAT: f64 = 37.5700;
    const LIBRARY_LON: f64 = 126.9820;

    async fn fixture(total_seats: i64) -> (TrackingManager, SeedIds, String) {
        let store = memory_store().await;
        let ids = seed_basic(&store, total_seats).await;
        let manager = TrackingManager::new(store, TrackingConfig::default());

        let now = Utc::now();
        let op = manager
            .store()
            .create_operation(NewOperation {
                id: None,
                organization_id: ids.organization_id.clone(),
                bus_id: ids.bus_id.clone(),
                driver_id: ids.driver_id.clone(),
                route_id: ids.route_id.clone(),
                scheduled_start: now - ChronoDuration::minutes(5),
                scheduled_end: now + ChronoDuration::hours(1),
            })
            .await
            .unwrap();
        (manager, ids, op.id)
    }

    async fn start(manager: &TrackingManager, ids: &SeedIds, op_id: &str) {
        manager
            .start_operation(&StartRequest {
                operation_id: op_id.to_string(),
                driver_id: ids.driver_id.clone(),
                organization_id: ids.organization_id.clone(),
                latitude: ORIGIN_LAT,
                longitude: ORIGIN_LON,
                early_start: false,
            })
            .await
            .unwrap();
    }

    fn sample(op_id: &str, lat: f64, lon: f64, passengers: i64) -> DriverLocationSample {
        DriverLocationSample {
            operation_id: op_id.to_string(),
            latitude: lat,
            longitude: lon,
            current_passengers: passengers,
            timestamp: 1_700_000_000_000,
        }
    }

    /// Passenger coordinates `delta_m` meters north of a point.
    fn north_of(lat: f64, delta_m: f64) -> f64 {
        lat + delta_m / 111_195.0
    }

    #[tokio::test]
    async fn ingest_rejected_unless_in_progress() {
        let (manager, _ids, op_id) = fixture(40).await;

        // still SCHEDULED
        let accepted = manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();
        assert!(!accepted);
        assert!(manager.cache().is_empty());

        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.total_passengers, 0);

        // unknown operation
        let accepted = manager
            .ingest_driver_location(sample("op-nope", ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn ingest_updates_cache_counts_and_station() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;

        let accepted = manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 7))
            .await
            .unwrap();
        assert!(accepted);

        let entry = manager.cache().get(&op_id).unwrap();
        assert_eq!(entry.bus_number, "1001");
        assert_eq!(entry.sample.current_passengers, 7);
        assert_eq!(entry.current_station_name.as_deref(), Some("Main Gate"));

        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.total_passengers, 7);
        let bus = manager.store().bus(&ids.bus_id).await.unwrap();
        assert_eq!(bus.occupied_seats, 7);
        assert_eq!(bus.last_lat, Some(ORIGIN_LAT));

        let statuses = manager.organization_statuses(&ids.organization_id);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].available_seats, 33);
    }

    #[tokio::test]
    async fn ingest_clamps_reported_count_to_capacity() {
        let (manager, ids, op_id) = fixture(10).await;
        start(&manager, &ids, &op_id).await;

        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 99))
            .await
            .unwrap();
        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.total_passengers, 10);
    }

    #[tokio::test]
    async fn station_progress_advances_with_the_bus() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;

        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();
        // bus reaches the second station
        manager
            .ingest_driver_location(sample(&op_id, LIBRARY_LAT, LIBRARY_LON, 0))
            .await
            .unwrap();

        let bus = manager.store().bus(&ids.bus_id).await.unwrap();
        assert_eq!(bus.prev_station_index, 1);
        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.total_stops_completed, 1);
        let entry = manager.cache().get(&op_id).unwrap();
        assert_eq!(entry.current_station_name.as_deref(), Some("Library"));
    }

    #[tokio::test]
    async fn ingest_broadcasts_to_subscribed_passengers() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;

        let (tx, mut rx) = mpsc::channel(sessions::SESSION_QUEUE_DEPTH);
        manager
            .sessions()
            .register_passenger(Uuid::new_v4(), &ids.organization_id, None, tx);

        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 3))
            .await
            .unwrap();

        let message = rx.try_recv().unwrap();
        assert!(message.contains("\"type\":\"busUpdate\""));
        assert!(message.contains("\"currentPassengers\":3"));
    }

    #[tokio::test]
    async fn auto_boarding_end_to_end() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;
        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();

        let lat = north_of(ORIGIN_LAT, 10.0);
        for _ in 0..2 {
            let result = manager
                .process_passenger_location(&ids.organization_id, "u1", lat, ORIGIN_LON)
                .await
                .unwrap();
            assert!(result.is_none());
        }
        let result = manager
            .process_passenger_location(&ids.organization_id, "u1", lat, ORIGIN_LON)
            .await
            .unwrap()
            .expect("boarding should commit on the third sample");
        assert_eq!(result.action, BoardingAction::Board);
        assert!(result.successful);
        assert!(result.auto_detected);
        assert_eq!(result.bus_number, "1001");

        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.total_passengers, 1);
        assert!(manager.detection().is_on_bus("u1"));

        // cached count was reconciled without waiting for the next sample
        let entry = manager.cache().get(&op_id).unwrap();
        assert_eq!(entry.sample.current_passengers, 1);
    }

    #[tokio::test]
    async fn full_bus_rejects_the_next_boarder() {
        let (manager, ids, op_id) = fixture(1).await;
        start(&manager, &ids, &op_id).await;
        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();

        let lat = north_of(ORIGIN_LAT, 10.0);
        for _ in 0..3 {
            manager
                .process_passenger_location(&ids.organization_id, "u1", lat, ORIGIN_LON)
                .await
                .unwrap();
        }
        assert!(manager.detection().is_on_bus("u1"));

        let mut last = None;
        for _ in 0..3 {
            last = manager
                .process_passenger_location(&ids.organization_id, "u2", lat, ORIGIN_LON)
                .await
                .unwrap();
        }
        let result = last.expect("capacity rejection should surface a result");
        assert!(!result.successful);
        assert_eq!(result.action, BoardingAction::Board);
        assert!(!manager.detection().is_on_bus("u2"));

        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.total_passengers, 1);
    }

    #[tokio::test]
    async fn auto_alighting_end_to_end() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;
        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();

        let near = north_of(ORIGIN_LAT, 10.0);
        for _ in 0..3 {
            manager
                .process_passenger_location(&ids.organization_id, "u1", near, ORIGIN_LON)
                .await
                .unwrap();
        }
        assert!(manager.detection().is_on_bus("u1"));

        let far = north_of(ORIGIN_LAT, 80.0);
        for _ in 0..2 {
            let result = manager
                .process_passenger_location(&ids.organization_id, "u1", far, ORIGIN_LON)
                .await
                .unwrap();
            assert!(result.is_none());
        }
        let result = manager
            .process_passenger_location(&ids.organization_id, "u1", far, ORIGIN_LON)
            .await
            .unwrap()
            .expect("alighting should commit on the third sample");
        assert_eq!(result.action, BoardingAction::Alight);
        assert!(result.successful);

        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.total_passengers, 0);
        assert!(!manager.detection().is_on_bus("u1"));
    }

    #[tokio::test]
    async fn completed_operation_forces_immediate_alight() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;
        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();

        let near = north_of(ORIGIN_LAT, 10.0);
        for _ in 0..3 {
            manager
                .process_passenger_location(&ids.organization_id, "u1", near, ORIGIN_LON)
                .await
                .unwrap();
        }
        assert!(manager.detection().is_on_bus("u1"));

        // operation completes externally; the cache entry goes with it
        manager
            .update_status(&op_id, OperationStatus::Completed, None, None)
            .await
            .unwrap();
        assert!(manager.cache().get(&op_id).is_none());

        // the very next sample drops the passenger, no debounce
        let result = manager
            .process_passenger_location(&ids.organization_id, "u1", near, ORIGIN_LON)
            .await
            .unwrap()
            .expect("forced alight should surface a result");
        assert_eq!(result.action, BoardingAction::Alight);
        assert!(result.successful);
        assert!(!manager.detection().is_on_bus("u1"));
    }

    #[tokio::test]
    async fn manual_boarding_round_trip() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;
        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();

        let boarded = manager
            .manual_boarding(&ids.organization_id, "u1", "1001", BoardingAction::Board)
            .await
            .unwrap();
        assert!(boarded.successful);
        assert!(!boarded.auto_detected);
        assert!(manager.detection().is_on_bus("u1"));
        assert_eq!(
            manager.store().operation(&op_id).await.unwrap().total_passengers,
            1
        );

        let alighted = manager
            .manual_boarding(&ids.organization_id, "u1", "1001", BoardingAction::Alight)
            .await
            .unwrap();
        assert!(alighted.successful);
        assert!(!manager.detection().is_on_bus("u1"));
        assert_eq!(
            manager.store().operation(&op_id).await.unwrap().total_passengers,
            0
        );

        let unknown = manager
            .manual_boarding(&ids.organization_id, "u1", "9999", BoardingAction::Board)
            .await;
        assert!(matches!(unknown, Err(TrackingError::NotFound(_))));
    }

    #[tokio::test]
    async fn end_operation_evicts_cache_entry() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;
        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();
        assert!(manager.cache().get(&op_id).is_some());

        manager
            .end_operation(&EndRequest {
                operation_id: op_id.clone(),
                driver_id: ids.driver_id.clone(),
                organization_id: ids.organization_id.clone(),
                end_reason: None,
            })
            .await
            .unwrap();
        assert!(manager.cache().get(&op_id).is_none());

        // a late sample from the driver app is now rejected
        let accepted = manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn autoclose_sweep_evicts_cache() {
        let (manager, ids, op_id) = fixture(40).await;
        start(&manager, &ids, &op_id).await;
        manager
            .ingest_driver_location(sample(&op_id, ORIGIN_LAT, ORIGIN_LON, 0))
            .await
            .unwrap();

        // pretend 3 hours pass with no activity
        let later = Utc::now() + ChronoDuration::hours(3);
        manager.run_autoclose_sweep_at(later).await;

        let op = manager.store().operation(&op_id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(manager.cache().get(&op_id).is_none());
    }

    #[test]
    fn nearest_station_respects_radius_and_window() {
        let stations = vec![
            RouteStation {
                sequence: 0,
                name: "A".into(),
                lat: ORIGIN_LAT,
                lon: ORIGIN_LON,
            },
            RouteStation {
                sequence: 1,
                name: "B".into(),
                lat: LIBRARY_LAT,
                lon: LIBRARY_LON,
            },
        ];

        let at_a = nearest_station(&stations, 0, ORIGIN_LAT, ORIGIN_LON, 100.0).unwrap();
        assert_eq!(at_a.name, "A");

        let at_b = nearest_station(&stations, 0, LIBRARY_LAT, LIBRARY_LON, 100.0).unwrap();
        assert_eq!(at_b.name, "B");

        // between the two, outside both radii
        assert!(nearest_station(&stations, 0, 37.5682, 126.9800, 100.0).is_none());

        assert!(nearest_station(&[], 0, ORIGIN_LAT, ORIGIN_LON, 100.0).is_none());
    }
}
