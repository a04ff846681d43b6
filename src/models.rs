use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle status of a single bus operation (one scheduled/actual run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Scheduled => "SCHEDULED",
            OperationStatus::InProgress => "IN_PROGRESS",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(OperationStatus::Scheduled),
            "IN_PROGRESS" => Some(OperationStatus::InProgress),
            "COMPLETED" => Some(OperationStatus::Completed),
            "CANCELLED" => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Cancelled)
    }
}

/// One scheduled/actual bus run.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub organization_id: String,
    pub bus_id: String,
    pub driver_id: String,
    pub route_id: String,
    pub status: OperationStatus,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub total_passengers: i64,
    pub total_stops_completed: i64,
    pub updated_at: DateTime<Utc>,
}

/// Physical vehicle snapshot.
#[derive(Debug, Clone)]
pub struct Bus {
    pub id: String,
    pub bus_number: String,
    pub organization_id: String,
    pub route_id: Option<String>,
    pub total_seats: i64,
    pub occupied_seats: i64,
    pub is_operating: bool,
    /// Sequence of the last route station this bus was observed at.
    pub prev_station_index: i64,
    pub last_lat: Option<f64>,
    pub last_lon: Option<f64>,
    pub last_location_update: Option<DateTime<Utc>>,
}

impl Bus {
    pub fn available_seats(&self) -> i64 {
        self.total_seats - self.occupied_seats
    }
}

#[derive(Debug, Clone)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub organization_id: String,
}

/// An ordered stop on a route. Sequence 0 is the origin.
#[derive(Debug, Clone)]
pub struct RouteStation {
    pub sequence: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// One GPS sample pushed by the driver app. Transient: kept only in the
/// location cache, overwritten by the next sample.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationSample {
    pub operation_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub current_passengers: i64,
    /// Client-side epoch milliseconds.
    pub timestamp: i64,
}

/// Live bus state pushed to subscribed passenger connections.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BusStatus {
    pub operation_id: String,
    pub bus_number: String,
    pub route_name: Option<String>,
    pub organization_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub total_seats: i64,
    pub current_passengers: i64,
    pub available_seats: i64,
    pub current_station_name: Option<String>,
    pub driver_name: Option<String>,
    /// Epoch milliseconds of the last driver sample.
    pub last_update_time: i64,
    pub is_active: bool,
}

/// Board or alight, both for manual requests and auto-detection commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardingAction {
    Board,
    Alight,
}

/// Outcome of a (manual or auto-detected) boarding/alighting attempt.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoardingDetectionResult {
    pub user_id: String,
    pub operation_id: String,
    pub bus_number: String,
    pub action: BoardingAction,
    pub auto_detected: bool,
    /// Passenger-to-bus distance in meters at commit time.
    pub detection_distance: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub successful: bool,
    pub message: String,
}

/// Flat operation view for listing endpoints (no joined bus/driver names).
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub operation_id: String,
    pub organization_id: String,
    pub bus_id: String,
    pub driver_id: String,
    pub route_id: String,
    pub status: OperationStatus,
    /// RFC 3339 timestamps.
    pub scheduled_start: String,
    pub scheduled_end: String,
    pub actual_start: Option<String>,
    pub actual_end: Option<String>,
    pub total_passengers: i64,
    pub total_stops_completed: i64,
}

impl Operation {
    pub fn summary(&self) -> OperationSummary {
        let fmt = |t: &DateTime<Utc>| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        OperationSummary {
            operation_id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            bus_id: self.bus_id.clone(),
            driver_id: self.driver_id.clone(),
            route_id: self.route_id.clone(),
            status: self.status,
            scheduled_start: fmt(&self.scheduled_start),
            scheduled_end: fmt(&self.scheduled_end),
            actual_start: self.actual_start.as_ref().map(fmt),
            actual_end: self.actual_end.as_ref().map(fmt),
            total_passengers: self.total_passengers,
            total_stops_completed: self.total_stops_completed,
        }
    }
}

/// Operation view returned by the driver-facing lifecycle endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub operation_id: String,
    pub status: OperationStatus,
    pub bus_id: String,
    pub bus_number: String,
    pub bus_is_operating: bool,
    pub driver_id: String,
    pub driver_name: String,
    pub route_id: String,
    pub route_name: Option<String>,
    /// RFC 3339 timestamps.
    pub scheduled_start: String,
    pub scheduled_end: String,
    pub actual_start: Option<String>,
    pub actual_end: Option<String>,
    pub total_passengers: i64,
    pub total_stops_completed: i64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            OperationStatus::Scheduled,
            OperationStatus::InProgress,
            OperationStatus::Completed,
            OperationStatus::Cancelled,
        ] {
            assert_eq!(OperationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OperationStatus::parse("RUNNING"), None);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&OperationStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn driver_sample_uses_camel_case() {
        let json = r#"{"operationId":"op-1","latitude":37.5,"longitude":127.0,"currentPassengers":3,"timestamp":1700000000000}"#;
        let sample: DriverLocationSample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.operation_id, "op-1");
        assert_eq!(sample.current_passengers, 3);
    }
}
