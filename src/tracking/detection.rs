use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::TrackingConfig;
use crate::geo;

/// Position of one in-progress bus, as seen from the location cache.
#[derive(Debug, Clone)]
pub struct BusCandidate {
    pub operation_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// What the engine wants done after consuming one passenger sample. The
/// caller performs the (async) passenger-count mutation and reports back via
/// [`DetectionEngine::commit_board`] and friends.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Nothing to commit; debounce counters may have moved.
    None,
    /// Boarding debounce satisfied for this operation.
    TryBoard { operation_id: String, distance: f64 },
    /// Alighting debounce satisfied.
    TryAlight { operation_id: String, distance: f64 },
    /// The operation the passenger was riding is gone; drop to off-bus with
    /// no debounce, the ride is definitively over.
    ForceAlight { operation_id: String },
}

/// Per-passenger debounce state. Two macro-states: off-bus (boarding
/// candidate evaluation) and on-bus (alighting evaluation).
#[derive(Debug)]
struct PassengerState {
    organization_id: String,
    latitude: f64,
    longitude: f64,
    on_bus: bool,
    current_operation_id: Option<String>,
    boarding_count: u32,
    pending_operation_id: Option<String>,
    alighting_count: u32,
    last_seen: Instant,
}

impl PassengerState {
    fn new(organization_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            latitude: 0.0,
            longitude: 0.0,
            on_bus: false,
            current_operation_id: None,
            boarding_count: 0,
            pending_operation_id: None,
            alighting_count: 0,
            last_seen: Instant::now(),
        }
    }

    fn reset_boarding(&mut self) {
        self.boarding_count = 0;
        self.pending_operation_id = None;
    }

    fn board(&mut self, operation_id: &str) {
        self.on_bus = true;
        self.current_operation_id = Some(operation_id.to_string());
        self.boarding_count = 0;
        self.pending_operation_id = None;
        self.alighting_count = 0;
    }

    fn alight(&mut self) {
        self.on_bus = false;
        self.current_operation_id = None;
        self.boarding_count = 0;
        self.pending_operation_id = None;
        self.alighting_count = 0;
    }
}

/// Converts noisy passenger GPS into discrete board/alight decisions by
/// requiring several consecutive confirming samples. States are created
/// lazily on the first sample from a user and swept after inactivity; a
/// restart simply restarts the debounce.
pub struct DetectionEngine {
    states: DashMap<String, PassengerState>,
    boarding_radius_m: f64,
    alighting_radius_m: f64,
    consecutive_samples: u32,
}

impl DetectionEngine {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            states: DashMap::new(),
            boarding_radius_m: config.boarding_radius_m,
            alighting_radius_m: config.alighting_radius_m,
            consecutive_samples: config.consecutive_samples,
        }
    }

    /// Consumes one passenger location sample. Runs entirely under the
    /// per-key map entry, so concurrent samples for the same user cannot
    /// lose counter increments; no I/O happens while the entry is held.
    pub fn observe(
        &self,
        user_id: &str,
        organization_id: &str,
        latitude: f64,
        longitude: f64,
        candidates: &[BusCandidate],
    ) -> Decision {
        let mut entry = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| PassengerState::new(organization_id));
        let state = entry.value_mut();
        state.organization_id = organization_id.to_string();
        state.latitude = latitude;
        state.longitude = longitude;
        state.last_seen = Instant::now();

        if state.on_bus {
            self.evaluate_alighting(user_id, state, candidates)
        } else {
            self.evaluate_boarding(user_id, state, candidates)
        }
    }

    fn evaluate_boarding(
        &self,
        user_id: &str,
        state: &mut PassengerState,
        candidates: &[BusCandidate],
    ) -> Decision {
        let closest = candidates
            .iter()
            .map(|c| {
                (
                    c,
                    geo::distance_meters(state.latitude, state.longitude, c.latitude, c.longitude),
                )
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Greater));

        match closest {
            Some((candidate, distance)) if distance <= self.boarding_radius_m => {
                if state.pending_operation_id.as_deref() != Some(&candidate.operation_id) {
                    state.pending_operation_id = Some(candidate.operation_id.clone());
                    state.boarding_count = 1;
                } else {
                    state.boarding_count += 1;
                }
                debug!(
                    user = user_id,
                    operation = %candidate.operation_id,
                    distance_m = distance.round(),
                    count = state.boarding_count,
                    "Boarding candidate within range"
                );
                if state.boarding_count >= self.consecutive_samples {
                    Decision::TryBoard {
                        operation_id: candidate.operation_id.clone(),
                        distance,
                    }
                } else {
                    Decision::None
                }
            }
            _ => {
                if state.boarding_count > 0 {
                    debug!(user = user_id, "No bus in range, boarding counter reset");
                }
                state.reset_boarding();
                Decision::None
            }
        }
    }

    fn evaluate_alighting(
        &self,
        user_id: &str,
        state: &mut PassengerState,
        candidates: &[BusCandidate],
    ) -> Decision {
        let current = match &state.current_operation_id {
            Some(id) => id.clone(),
            // On-bus with no operation should not happen; self-heal.
            None => {
                state.alight();
                return Decision::None;
            }
        };

        let bus = match candidates.iter().find(|c| c.operation_id == current) {
            Some(bus) => bus,
            None => return Decision::ForceAlight { operation_id: current },
        };

        let distance =
            geo::distance_meters(state.latitude, state.longitude, bus.latitude, bus.longitude);
        if distance <= self.alighting_radius_m {
            state.alighting_count = 0;
            return Decision::None;
        }

        state.alighting_count += 1;
        debug!(
            user = user_id,
            operation = %current,
            distance_m = distance.round(),
            count = state.alighting_count,
            "Passenger away from bus"
        );
        if state.alighting_count >= self.consecutive_samples {
            Decision::TryAlight {
                operation_id: current,
                distance,
            }
        } else {
            Decision::None
        }
    }

    /// Finalizes a successful boarding commit.
    pub fn commit_board(&self, user_id: &str, operation_id: &str) {
        if let Some(mut state) = self.states.get_mut(user_id) {
            state.board(operation_id);
            info!(user = user_id, operation = operation_id, "Passenger boarded");
        }
    }

    /// The boarding mutation was rejected (bus full). The counter resets so
    /// detection can start over next cycle in case a seat frees.
    pub fn board_rejected(&self, user_id: &str) {
        if let Some(mut state) = self.states.get_mut(user_id) {
            state.reset_boarding();
        }
    }

    /// Finalizes an alighting commit (debounced or forced).
    pub fn commit_alight(&self, user_id: &str) {
        if let Some(mut state) = self.states.get_mut(user_id) {
            state.alight();
            info!(user = user_id, "Passenger alighted");
        }
    }

    /// The alighting mutation was rejected; stay aboard and restart the
    /// debounce.
    pub fn alight_rejected(&self, user_id: &str) {
        if let Some(mut state) = self.states.get_mut(user_id) {
            state.alighting_count = 0;
        }
    }

    /// Manual override: transition immediately, bypassing and clearing the
    /// debounce counters so the next sample cannot immediately contradict
    /// the manual action.
    pub fn force_board(&self, user_id: &str, organization_id: &str, operation_id: &str) {
        let mut entry = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| PassengerState::new(organization_id));
        entry.value_mut().board(operation_id);
    }

    pub fn force_alight(&self, user_id: &str) {
        if let Some(mut state) = self.states.get_mut(user_id) {
            state.alight();
        }
    }

    pub fn current_operation(&self, user_id: &str) -> Option<String> {
        self.states
            .get(user_id)
            .and_then(|s| s.current_operation_id.clone())
    }

    pub fn is_on_bus(&self, user_id: &str) -> bool {
        self.states.get(user_id).map(|s| s.on_bus).unwrap_or(false)
    }

    /// Drops states idle beyond `ttl` to bound memory. Returns how many were
    /// evicted.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| state.last_seen.elapsed() <= ttl);
        before - self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
