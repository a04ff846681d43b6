use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::TrackingError;
use crate::models::{Bus, Driver, Operation, OperationStatus, RouteStation};

/// Fixed-width RFC 3339 (millisecond precision, `Z` suffix) so TEXT columns
/// compare lexicographically in time order.
pub(crate) fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, TrackingError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TrackingError::Internal(format!("bad timestamp '{s}': {e}")))
}

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: String,
    organization_id: String,
    bus_id: String,
    driver_id: String,
    route_id: String,
    status: String,
    scheduled_start: String,
    scheduled_end: String,
    actual_start: Option<String>,
    actual_end: Option<String>,
    total_passengers: i64,
    total_stops_completed: i64,
    updated_at: String,
}

impl OperationRow {
    fn into_operation(self) -> Result<Operation, TrackingError> {
        let status = OperationStatus::parse(&self.status)
            .ok_or_else(|| TrackingError::Internal(format!("unknown status '{}'", self.status)))?;
        Ok(Operation {
            id: self.id,
            organization_id: self.organization_id,
            bus_id: self.bus_id,
            driver_id: self.driver_id,
            route_id: self.route_id,
            status,
            scheduled_start: parse_ts(&self.scheduled_start)?,
            scheduled_end: parse_ts(&self.scheduled_end)?,
            actual_start: self.actual_start.as_deref().map(parse_ts).transpose()?,
            actual_end: self.actual_end.as_deref().map(parse_ts).transpose()?,
            total_passengers: self.total_passengers,
            total_stops_completed: self.total_stops_completed,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BusRow {
    id: String,
    bus_number: String,
    organization_id: String,
    route_id: Option<String>,
    total_seats: i64,
    occupied_seats: i64,
    is_operating: bool,
    prev_station_index: i64,
    last_lat: Option<f64>,
    last_lon: Option<f64>,
    last_location_update: Option<String>,
}

impl BusRow {
    fn into_bus(self) -> Result<Bus, TrackingError> {
        Ok(Bus {
            id: self.id,
            bus_number: self.bus_number,
            organization_id: self.organization_id,
            route_id: self.route_id,
            total_seats: self.total_seats,
            occupied_seats: self.occupied_seats,
            is_operating: self.is_operating,
            prev_station_index: self.prev_station_index,
            last_lat: self.last_lat,
            last_lon: self.last_lon,
            last_location_update: self.last_location_update.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Parameters for creating a new scheduled operation (consumed by the
/// administrative collaborators and by fixtures/tests).
#[derive(Debug, Clone)]
pub struct NewOperation {
    /// Generated if absent.
    pub id: Option<String>,
    pub organization_id: String,
    pub bus_id: String,
    pub driver_id: String,
    pub route_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
}

/// SQLite-backed directory of buses, drivers, routes and operations.
/// All real-time state lives in the in-memory tracking structures; this
/// store holds the durable records they gate against.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn bus(&self, id: &str) -> Result<Bus, TrackingError> {
        let row: Option<BusRow> = sqlx::query_as("SELECT * FROM buses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| TrackingError::NotFound(format!("bus {id}")))?
            .into_bus()
    }

    pub async fn bus_by_number(
        &self,
        organization_id: &str,
        bus_number: &str,
    ) -> Result<Bus, TrackingError> {
        let row: Option<BusRow> =
            sqlx::query_as("SELECT * FROM buses WHERE organization_id = ? AND bus_number = ?")
                .bind(organization_id)
                .bind(bus_number)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| TrackingError::NotFound(format!("bus {bus_number}")))?
            .into_bus()
    }

    pub async fn driver(&self, id: &str) -> Result<Driver, TrackingError> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id, name, organization_id FROM drivers WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(id, name, organization_id)| Driver {
            id,
            name,
            organization_id,
        })
        .ok_or_else(|| TrackingError::NotFound(format!("driver {id}")))
    }

    pub async fn route_name(&self, id: &str) -> Result<Option<String>, TrackingError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM routes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(name,)| name))
    }

    /// Route stations ordered by sequence; sequence 0 is the origin.
    pub async fn route_stations(&self, route_id: &str) -> Result<Vec<RouteStation>, TrackingError> {
        let rows: Vec<(i64, String, f64, f64)> = sqlx::query_as(
            "SELECT sequence, name, lat, lon FROM route_stations WHERE route_id = ? ORDER BY sequence",
        )
        .bind(route_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(sequence, name, lat, lon)| RouteStation {
                sequence,
                name,
                lat,
                lon,
            })
            .collect())
    }

    pub async fn operation(&self, id: &str) -> Result<Operation, TrackingError> {
        let row: Option<OperationRow> = sqlx::query_as("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| TrackingError::NotFound(format!("operation {id}")))?
            .into_operation()
    }

    pub async fn operations_by_organization(
        &self,
        organization_id: &str,
        status: Option<OperationStatus>,
    ) -> Result<Vec<Operation>, TrackingError> {
        let rows: Vec<OperationRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM operations WHERE organization_id = ? AND status = ? ORDER BY scheduled_start",
                )
                .bind(organization_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM operations WHERE organization_id = ? ORDER BY scheduled_start",
                )
                .bind(organization_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    pub async fn operations_for_driver(
        &self,
        driver_id: &str,
        organization_id: &str,
    ) -> Result<Vec<Operation>, TrackingError> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            "SELECT * FROM operations WHERE driver_id = ? AND organization_id = ? ORDER BY scheduled_start",
        )
        .bind(driver_id)
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    pub async fn in_progress_operation_for_bus(
        &self,
        bus_id: &str,
    ) -> Result<Option<Operation>, TrackingError> {
        let row: Option<OperationRow> =
            sqlx::query_as("SELECT * FROM operations WHERE bus_id = ? AND status = 'IN_PROGRESS'")
                .bind(bus_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(OperationRow::into_operation).transpose()
    }

    /// Operations past their scheduled end that never reached a terminal
    /// status. Candidates for the auto-close sweep.
    pub async fn expired_operations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Operation>, TrackingError> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            "SELECT * FROM operations WHERE scheduled_end < ? AND status IN ('SCHEDULED', 'IN_PROGRESS')",
        )
        .bind(format_ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    pub async fn create_operation(&self, new: NewOperation) -> Result<Operation, TrackingError> {
        // Referenced entities must exist and belong to the same organization.
        let bus = self.bus(&new.bus_id).await?;
        if bus.organization_id != new.organization_id {
            return Err(TrackingError::NotFound(format!(
                "bus {} in organization {}",
                new.bus_id, new.organization_id
            )));
        }
        let driver = self.driver(&new.driver_id).await?;
        if driver.organization_id != new.organization_id {
            return Err(TrackingError::NotFound(format!(
                "driver {} in organization {}",
                new.driver_id, new.organization_id
            )));
        }

        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = format_ts(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO operations
                (id, organization_id, bus_id, driver_id, route_id, status,
                 scheduled_start, scheduled_end, updated_at)
            VALUES (?, ?, ?, ?, ?, 'SCHEDULED', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.organization_id)
        .bind(&new.bus_id)
        .bind(&new.driver_id)
        .bind(&new.route_id)
        .bind(format_ts(new.scheduled_start))
        .bind(format_ts(new.scheduled_end))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.operation(&id).await
    }

    /// Applies an accepted driver sample: bus location/seat snapshot and the
    /// operation's reported passenger count, last-write-wins. `station`
    /// advances the nearest-station progress when present.
    pub async fn apply_driver_sample(
        &self,
        operation_id: &str,
        bus_id: &str,
        latitude: f64,
        longitude: f64,
        passengers: i64,
        station: Option<&RouteStation>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let ts = format_ts(now);
        let mut tx = self.pool.begin().await?;

        match station {
            Some(station) => {
                sqlx::query(
                    r#"
                    UPDATE buses
                    SET last_lat = ?, last_lon = ?, last_location_update = ?,
                        occupied_seats = ?, prev_station_index = ?
                    WHERE id = ?
                    "#,
                )
                .bind(latitude)
                .bind(longitude)
                .bind(&ts)
                .bind(passengers)
                .bind(station.sequence)
                .bind(bus_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE operations
                    SET total_passengers = ?, total_stops_completed = total_stops_completed + 1,
                        updated_at = ?
                    WHERE id = ? AND status = 'IN_PROGRESS'
                    "#,
                )
                .bind(passengers)
                .bind(&ts)
                .bind(operation_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE buses
                    SET last_lat = ?, last_lon = ?, last_location_update = ?, occupied_seats = ?
                    WHERE id = ?
                    "#,
                )
                .bind(latitude)
                .bind(longitude)
                .bind(&ts)
                .bind(passengers)
                .bind(bus_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE operations SET total_passengers = ?, updated_at = ? WHERE id = ? AND status = 'IN_PROGRESS'",
                )
                .bind(passengers)
                .bind(&ts)
                .bind(operation_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Loads fixture data into an empty database. A database that already
    /// has buses is left untouched.
    pub async fn seed_if_empty(&self, seed: &SeedData) -> Result<bool, TrackingError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM buses")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;

        for driver in &seed.drivers {
            sqlx::query("INSERT INTO drivers (id, name, organization_id) VALUES (?, ?, ?)")
                .bind(&driver.id)
                .bind(&driver.name)
                .bind(&driver.organization_id)
                .execute(&mut *tx)
                .await?;
        }

        for route in &seed.routes {
            sqlx::query("INSERT INTO routes (id, name, organization_id) VALUES (?, ?, ?)")
                .bind(&route.id)
                .bind(&route.name)
                .bind(&route.organization_id)
                .execute(&mut *tx)
                .await?;

            for (sequence, station) in route.stations.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO route_stations (route_id, sequence, name, lat, lon) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&route.id)
                .bind(sequence as i64)
                .bind(&station.name)
                .bind(station.lat)
                .bind(station.lon)
                .execute(&mut *tx)
                .await?;
            }
        }

        for bus in &seed.buses {
            sqlx::query(
                "INSERT INTO buses (id, bus_number, organization_id, route_id, total_seats) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&bus.id)
            .bind(&bus.bus_number)
            .bind(&bus.organization_id)
            .bind(&bus.route_id)
            .bind(bus.total_seats)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            drivers = seed.drivers.len(),
            routes = seed.routes.len(),
            buses = seed.buses.len(),
            "Seeded fixture data"
        );
        Ok(true)
    }
}

/// Fixture file contents (see seed.yaml).
#[derive(Debug, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub drivers: Vec<SeedDriver>,
    #[serde(default)]
    pub routes: Vec<SeedRoute>,
    #[serde(default)]
    pub buses: Vec<SeedBus>,
}

#[derive(Debug, Deserialize)]
pub struct SeedDriver {
    pub id: String,
    pub name: String,
    pub organization_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SeedRoute {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    /// Ordered; the first station is the route origin.
    #[serde(default)]
    pub stations: Vec<SeedStation>,
}

#[derive(Debug, Deserialize)]
pub struct SeedStation {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct SeedBus {
    pub id: String,
    pub bus_number: String,
    pub organization_id: String,
    pub route_id: Option<String>,
    pub total_seats: i64,
}
