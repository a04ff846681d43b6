use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::TrackingConfig;
use crate::error::TrackingError;
use crate::geo;
use crate::models::{OperationSnapshot, OperationStatus};
use crate::store::{format_ts, Store};

/// The only legal status transitions. Everything else is `WrongState`,
/// including any move out of a terminal status.
pub fn transition_allowed(from: OperationStatus, to: OperationStatus) -> bool {
    use OperationStatus::*;
    matches!(
        (from, to),
        (Scheduled, InProgress) | (Scheduled, Cancelled) | (InProgress, Completed)
    )
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub operation_id: String,
    pub driver_id: String,
    pub organization_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub early_start: bool,
}

#[derive(Debug, Clone)]
pub struct EndRequest {
    pub operation_id: String,
    pub driver_id: String,
    pub organization_id: String,
    pub end_reason: Option<String>,
}

/// Owns the state machine for bus runs and gates every status or passenger
/// count mutation, interactive or swept. Both auto-detection and manual
/// boarding funnel through [`OperationLifecycle::adjust_passenger_count`].
#[derive(Clone)]
pub struct OperationLifecycle {
    store: Store,
    config: TrackingConfig,
}

impl OperationLifecycle {
    pub fn new(store: Store, config: TrackingConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn start_operation(
        &self,
        req: &StartRequest,
    ) -> Result<OperationSnapshot, TrackingError> {
        self.start_operation_at(req, Utc::now()).await
    }

    pub(crate) async fn start_operation_at(
        &self,
        req: &StartRequest,
        now: DateTime<Utc>,
    ) -> Result<OperationSnapshot, TrackingError> {
        let op = self.store.operation(&req.operation_id).await?;
        if op.organization_id != req.organization_id {
            return Err(TrackingError::NotFound(format!(
                "operation {} in organization {}",
                req.operation_id, req.organization_id
            )));
        }
        if op.status != OperationStatus::Scheduled {
            return Err(TrackingError::WrongState(format!(
                "operation {} is {}",
                op.id,
                op.status.as_str()
            )));
        }
        if op.driver_id != req.driver_id {
            return Err(TrackingError::Authz(format!(
                "driver {} is not assigned to operation {}",
                req.driver_id, op.id
            )));
        }

        let bus = self.store.bus(&op.bus_id).await?;
        if bus.is_operating {
            return Err(TrackingError::WrongState(format!(
                "bus {} is already operating",
                bus.bus_number
            )));
        }

        let earliest = if req.early_start {
            op.scheduled_start - Duration::minutes(self.config.early_start_allowance_minutes)
        } else {
            op.scheduled_start
        };
        if now < earliest {
            return Err(TrackingError::OutOfWindow(format!(
                "operation {} may start from {}",
                op.id,
                format_ts(earliest)
            )));
        }

        // Origin geofence: the route's first station, when the route has one.
        let stations = self.store.route_stations(&op.route_id).await?;
        if let Some(origin) = stations.first() {
            let distance =
                geo::distance_meters(req.latitude, req.longitude, origin.lat, origin.lon);
            if distance > self.config.arrival_radius_m {
                return Err(TrackingError::OutOfRange(format!(
                    "{:.0}m from origin {} (allowed {:.0}m)",
                    distance, origin.name, self.config.arrival_radius_m
                )));
            }
        } else {
            warn!(operation = %op.id, route = %op.route_id, "Route has no stations, skipping origin check");
        }

        let ts = format_ts(now);
        let mut tx = self.store.pool().begin().await?;
        let bus_rows =
            sqlx::query("UPDATE buses SET is_operating = 1, prev_station_index = 0 WHERE id = ? AND is_operating = 0")
                .bind(&op.bus_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        let op_rows = sqlx::query(
            "UPDATE operations SET status = 'IN_PROGRESS', actual_start = ?, updated_at = ? WHERE id = ? AND status = 'SCHEDULED'",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(&op.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if bus_rows == 0 || op_rows == 0 {
            // Lost a race with another start; the dropped transaction rolls back.
            return Err(TrackingError::WrongState(format!(
                "operation {} changed concurrently",
                op.id
            )));
        }
        tx.commit().await?;

        info!(operation = %op.id, driver = %req.driver_id, early = req.early_start, "Operation started");
        self.snapshot(&op.id, "drive started").await
    }

    pub async fn end_operation(
        &self,
        req: &EndRequest,
    ) -> Result<OperationSnapshot, TrackingError> {
        self.end_operation_at(req, Utc::now()).await
    }

    pub(crate) async fn end_operation_at(
        &self,
        req: &EndRequest,
        now: DateTime<Utc>,
    ) -> Result<OperationSnapshot, TrackingError> {
        let op = self.store.operation(&req.operation_id).await?;
        if op.organization_id != req.organization_id {
            return Err(TrackingError::NotFound(format!(
                "operation {} in organization {}",
                req.operation_id, req.organization_id
            )));
        }
        if op.status != OperationStatus::InProgress {
            return Err(TrackingError::WrongState(format!(
                "operation {} is {}",
                op.id,
                op.status.as_str()
            )));
        }
        if op.driver_id != req.driver_id {
            return Err(TrackingError::Authz(format!(
                "driver {} is not assigned to operation {}",
                req.driver_id, op.id
            )));
        }

        let ts = format_ts(now);
        let mut tx = self.store.pool().begin().await?;
        sqlx::query("UPDATE buses SET is_operating = 0, occupied_seats = 0 WHERE id = ?")
            .bind(&op.bus_id)
            .execute(&mut *tx)
            .await?;
        let op_rows = sqlx::query(
            "UPDATE operations SET status = 'COMPLETED', actual_end = ?, updated_at = ? WHERE id = ? AND status = 'IN_PROGRESS'",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(&op.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if op_rows == 0 {
            return Err(TrackingError::WrongState(format!(
                "operation {} changed concurrently",
                op.id
            )));
        }
        tx.commit().await?;

        info!(operation = %op.id, driver = %req.driver_id, "Operation ended");
        let message = match &req.end_reason {
            Some(reason) => format!("drive ended: {reason}"),
            None => "drive ended".to_string(),
        };
        self.snapshot(&op.id, &message).await
    }

    /// Administrative transition used out-of-band (forced cancellation,
    /// sweep auto-close). Skips the geofence/time-window policies but still
    /// respects the transition table.
    pub async fn update_status(
        &self,
        operation_id: &str,
        new_status: OperationStatus,
        passenger_hint: Option<i64>,
        stops_hint: Option<i64>,
    ) -> Result<(), TrackingError> {
        self.update_status_at(operation_id, new_status, passenger_hint, stops_hint, Utc::now())
            .await
    }

    pub(crate) async fn update_status_at(
        &self,
        operation_id: &str,
        new_status: OperationStatus,
        passenger_hint: Option<i64>,
        stops_hint: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let op = self.store.operation(operation_id).await?;
        if !transition_allowed(op.status, new_status) {
            return Err(TrackingError::WrongState(format!(
                "cannot move {} operation {} to {}",
                op.status.as_str(),
                op.id,
                new_status.as_str()
            )));
        }

        let ts = format_ts(now);
        let mut tx = self.store.pool().begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE operations
            SET status = ?, updated_at = ?,
                total_passengers = COALESCE(?, total_passengers),
                total_stops_completed = COALESCE(?, total_stops_completed),
                actual_start = CASE WHEN ? = 'IN_PROGRESS' THEN ? ELSE actual_start END,
                actual_end = CASE WHEN ? IN ('COMPLETED', 'CANCELLED') THEN ? ELSE actual_end END
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(&ts)
        .bind(passenger_hint)
        .bind(stops_hint)
        .bind(new_status.as_str())
        .bind(&ts)
        .bind(new_status.as_str())
        .bind(&ts)
        .bind(&op.id)
        .bind(op.status.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(TrackingError::WrongState(format!(
                "operation {} changed concurrently",
                op.id
            )));
        }

        // Keep the bus flag in line with the invariant: operating iff an
        // in-progress operation references the bus.
        match new_status {
            OperationStatus::InProgress => {
                sqlx::query(
                    "UPDATE buses SET is_operating = 1, prev_station_index = 0 WHERE id = ?",
                )
                .bind(&op.bus_id)
                .execute(&mut *tx)
                .await?;
            }
            OperationStatus::Completed | OperationStatus::Cancelled => {
                sqlx::query("UPDATE buses SET is_operating = 0, occupied_seats = 0 WHERE id = ?")
                    .bind(&op.bus_id)
                    .execute(&mut *tx)
                    .await?;
            }
            OperationStatus::Scheduled => {}
        }
        tx.commit().await?;

        info!(operation = %op.id, from = op.status.as_str(), to = new_status.as_str(), "Operation status updated");
        Ok(())
    }

    /// Atomically adjusts the passenger count of an in-progress operation.
    /// The bounds check and increment run in a single conditional UPDATE, so
    /// concurrent callers (auto-detection racing a manual action) cannot lose
    /// updates or escape the [0, total_seats] envelope.
    pub async fn adjust_passenger_count(
        &self,
        operation_id: &str,
        delta: i64,
    ) -> Result<i64, TrackingError> {
        let ts = format_ts(Utc::now());
        let mut tx = self.store.pool().begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE operations
            SET total_passengers = total_passengers + ?2, updated_at = ?3
            WHERE id = ?1
              AND status = 'IN_PROGRESS'
              AND total_passengers + ?2 >= 0
              AND total_passengers + ?2 <= (SELECT total_seats FROM buses WHERE buses.id = operations.bus_id)
            "#,
        )
        .bind(operation_id)
        .bind(delta)
        .bind(&ts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            drop(tx);
            let op = self.store.operation(operation_id).await?;
            if op.status != OperationStatus::InProgress {
                return Err(TrackingError::WrongState(format!(
                    "operation {} is {}",
                    op.id,
                    op.status.as_str()
                )));
            }
            if delta < 0 {
                return Err(TrackingError::Capacity(format!(
                    "operation {} has no passengers to remove",
                    op.id
                )));
            }
            return Err(TrackingError::Capacity(format!(
                "operation {} is at capacity",
                op.id
            )));
        }

        sqlx::query(
            r#"
            UPDATE buses SET occupied_seats = (SELECT total_passengers FROM operations WHERE id = ?1)
            WHERE id = (SELECT bus_id FROM operations WHERE id = ?1)
            "#,
        )
        .bind(operation_id)
        .execute(&mut *tx)
        .await?;
        let (count,): (i64,) =
            sqlx::query_as("SELECT total_passengers FROM operations WHERE id = ?")
                .bind(operation_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Force-closes operations whose scheduled end has long passed with no
    /// sign of life. In-progress runs complete; never-started runs cancel
    /// (the transition table does not admit SCHEDULED -> COMPLETED).
    /// Returns the ids of the operations that were closed.
    pub async fn auto_close_abandoned(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, TrackingError> {
        let cutoff = now - Duration::hours(self.config.abandoned_after_hours);
        let mut closed = Vec::new();

        for op in self.store.expired_operations(now).await? {
            if op.updated_at >= cutoff {
                continue;
            }
            let target = match op.status {
                OperationStatus::InProgress => OperationStatus::Completed,
                OperationStatus::Scheduled => OperationStatus::Cancelled,
                _ => continue,
            };
            match self
                .update_status_at(&op.id, target, None, None, now)
                .await
            {
                Ok(()) => {
                    info!(operation = %op.id, status = target.as_str(), "Auto-closed abandoned operation");
                    closed.push(op.id);
                }
                // Raced with an interactive mutation; the re-checked status wins.
                Err(e) => warn!(operation = %op.id, error = %e, "Skipped auto-close"),
            }
        }

        Ok(closed)
    }

    pub async fn snapshot(
        &self,
        operation_id: &str,
        message: &str,
    ) -> Result<OperationSnapshot, TrackingError> {
        let op = self.store.operation(operation_id).await?;
        let bus = self.store.bus(&op.bus_id).await?;
        let driver = self.store.driver(&op.driver_id).await?;
        let route_name = self.store.route_name(&op.route_id).await?;
        Ok(OperationSnapshot {
            operation_id: op.id,
            status: op.status,
            bus_id: bus.id,
            bus_number: bus.bus_number,
            bus_is_operating: bus.is_operating,
            driver_id: driver.id,
            driver_name: driver.name,
            route_id: op.route_id,
            route_name,
            scheduled_start: format_ts(op.scheduled_start),
            scheduled_end: format_ts(op.scheduled_end),
            actual_start: op.actual_start.map(format_ts),
            actual_end: op.actual_end.map(format_ts),
            total_passengers: op.total_passengers,
            total_stops_completed: op.total_stops_completed,
            message: message.to_string(),
        })
    }
}
