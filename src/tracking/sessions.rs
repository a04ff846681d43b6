use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::BusStatus;

/// Outbound queue depth per connection. A subscriber that cannot drain this
/// many messages is skipped rather than allowed to stall ingestion.
pub const SESSION_QUEUE_DEPTH: usize = 32;

pub type ConnId = Uuid;

#[derive(Debug)]
struct PassengerSession {
    organization_id: String,
    user_id: Option<String>,
    tx: mpsc::Sender<String>,
}

#[derive(Debug)]
struct DriverSession {
    conn_id: ConnId,
    tx: mpsc::Sender<String>,
}

/// Wire envelope for server-initiated pushes.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum PushMessage<'a> {
    /// Fan-out to passenger connections.
    BusUpdate { data: &'a BusStatus },
    /// Direct push to the driver connection when the seat count changes
    /// underneath it (passenger boarded or alighted).
    SeatUpdate { data: &'a BusStatus },
}

/// Tracks live passenger/driver connections and fans state updates out to
/// them. Registration is idempotent; delivery is best-effort and never
/// fails the triggering mutation.
#[derive(Default)]
pub struct SessionRegistry {
    passengers: DashMap<ConnId, PassengerSession>,
    /// operation id -> the single driver connection for that operation.
    drivers: DashMap<String, DriverSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First registration wins for a connection's lifetime; re-registering
    /// the same connection leaves it untouched.
    pub fn register_passenger(
        &self,
        conn_id: ConnId,
        organization_id: &str,
        user_id: Option<String>,
        tx: mpsc::Sender<String>,
    ) {
        self.passengers.entry(conn_id).or_insert_with(|| {
            debug!(conn = %conn_id, organization = organization_id, "Passenger connection registered");
            PassengerSession {
                organization_id: organization_id.to_string(),
                user_id,
                tx,
            }
        });
    }

    /// A repeat registration by the same connection is a no-op; a different
    /// connection for the same operation replaces the stale one (driver app
    /// reconnect).
    pub fn register_driver(&self, operation_id: &str, conn_id: ConnId, tx: mpsc::Sender<String>) {
        match self.drivers.entry(operation_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().conn_id != conn_id {
                    debug!(operation = operation_id, conn = %conn_id, "Driver connection replaced");
                    occupied.insert(DriverSession { conn_id, tx });
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                debug!(operation = operation_id, conn = %conn_id, "Driver connection registered");
                vacant.insert(DriverSession { conn_id, tx });
            }
        }
    }

    /// Removes every registry entry for the connection; invoked on disconnect.
    pub fn unregister(&self, conn_id: ConnId) {
        self.passengers.remove(&conn_id);
        self.drivers.retain(|_, session| session.conn_id != conn_id);
    }

    /// Best-effort fan-out of a bus update to every passenger connection in
    /// the organization. A failed send is logged and skipped; it neither
    /// stops delivery to the rest nor raises to the caller. Returns how many
    /// connections the update was queued to.
    pub fn broadcast_bus_update(&self, organization_id: &str, status: &BusStatus) -> usize {
        let payload = match serde_json::to_string(&PushMessage::BusUpdate { data: status }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize bus update");
                return 0;
            }
        };

        let mut delivered = 0;
        for session in self.passengers.iter() {
            if session.organization_id != organization_id {
                continue;
            }
            match session.tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        conn = %session.key(),
                        user = session.user_id.as_deref().unwrap_or("-"),
                        error = %e,
                        "Dropped bus update for slow or closed connection"
                    );
                }
            }
        }
        delivered
    }

    /// Pushes the updated seat snapshot to the operation's driver
    /// connection.
    pub fn send_seat_update(&self, operation_id: &str, status: &BusStatus) -> bool {
        match serde_json::to_string(&PushMessage::SeatUpdate { data: status }) {
            Ok(payload) => self.send_to_driver(operation_id, &payload),
            Err(e) => {
                warn!(error = %e, "Failed to serialize seat update");
                false
            }
        }
    }

    /// Direct message to the driver connection for an operation; no-op when
    /// absent or closed.
    pub fn send_to_driver(&self, operation_id: &str, payload: &str) -> bool {
        match self.drivers.get(operation_id) {
            Some(session) => match session.tx.try_send(payload.to_string()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(operation = operation_id, error = %e, "Dropped driver message");
                    false
                }
            },
            None => false,
        }
    }

    pub fn passenger_count(&self) -> usize {
        self.passengers.len()
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(organization_id: &str) -> BusStatus {
        BusStatus {
            operation_id: "op-1".into(),
            bus_number: "1001".into(),
            route_name: None,
            organization_id: organization_id.to_string(),
            latitude: 37.5665,
            longitude: 126.9780,
            total_seats: 40,
            current_passengers: 5,
            available_seats: 35,
            current_station_name: None,
            driver_name: None,
            last_update_time: 1_700_000_000_000,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_organization() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (tx2, mut rx2) = mpsc::channel(SESSION_QUEUE_DEPTH);
        registry.register_passenger(Uuid::new_v4(), "org-1", Some("u1".into()), tx1);
        registry.register_passenger(Uuid::new_v4(), "org-2", None, tx2);

        let delivered = registry.broadcast_bus_update("org-1", &status("org-1"));
        assert_eq!(delivered, 1);

        let message = rx1.try_recv().unwrap();
        assert!(message.contains("\"type\":\"busUpdate\""));
        assert!(message.contains("\"operationId\":\"op-1\""));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_block_the_rest() {
        let registry = SessionRegistry::new();
        let (dead_tx, dead_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        drop(dead_rx);
        let (live_tx, mut live_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        registry.register_passenger(Uuid::new_v4(), "org-1", None, dead_tx);
        registry.register_passenger(Uuid::new_v4(), "org-1", None, live_tx);

        let delivered = registry.broadcast_bus_update("org-1", &status("org-1"));
        assert_eq!(delivered, 1);
        assert!(live_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn repeat_registration_is_a_noop() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (tx2, mut rx2) = mpsc::channel(SESSION_QUEUE_DEPTH);
        registry.register_passenger(conn, "org-1", Some("u1".into()), tx1);
        // second registration for the same connection is ignored
        registry.register_passenger(conn, "org-2", Some("u2".into()), tx2);
        assert_eq!(registry.passenger_count(), 1);

        registry.broadcast_bus_update("org-1", &status("org-1"));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn seat_update_reaches_the_driver() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        registry.register_driver("op-1", Uuid::new_v4(), tx);

        assert!(registry.send_seat_update("op-1", &status("org-1")));
        let message = rx.try_recv().unwrap();
        assert!(message.contains("\"type\":\"seatUpdate\""));
        assert!(message.contains("\"availableSeats\":35"));

        // no driver connection: silently a no-op
        assert!(!registry.send_seat_update("op-2", &status("org-1")));
    }

    #[tokio::test]
    async fn driver_reconnect_replaces_stale_connection() {
        let registry = SessionRegistry::new();
        let (old_tx, mut old_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (new_tx, mut new_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        registry.register_driver("op-1", Uuid::new_v4(), old_tx);
        registry.register_driver("op-1", Uuid::new_v4(), new_tx);
        assert_eq!(registry.driver_count(), 1);

        assert!(registry.send_to_driver("op-1", "{\"hello\":true}"));
        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.try_recv().is_ok());

        assert!(!registry.send_to_driver("op-missing", "{}"));
    }

    #[tokio::test]
    async fn unregister_removes_both_roles() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        registry.register_passenger(conn, "org-1", None, tx.clone());
        registry.register_driver("op-1", conn, tx);

        registry.unregister(conn);
        assert_eq!(registry.passenger_count(), 0);
        assert_eq!(registry.driver_count(), 0);
    }
}
