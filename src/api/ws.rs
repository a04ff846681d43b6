use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::AppState;
use crate::models::{BoardingAction, BoardingDetectionResult, DriverLocationSample};
use crate::tracking::sessions::SESSION_QUEUE_DEPTH;

/// Per-sample acknowledgement sent back to the driver app.
#[derive(Debug, Serialize)]
struct DriverAck {
    status: &'static str,
    message: String,
    /// Epoch milliseconds.
    timestamp: i64,
}

impl DriverAck {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Messages a passenger client may send, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum PassengerClientMessage {
    /// Subscribe to bus updates for an organization
    Subscribe {
        organization_id: String,
    },
    /// Passenger GPS sample, feeds the detection engine
    Location {
        organization_id: String,
        data: LocationData,
    },
    /// Manual board/alight, bypasses the debounce
    ManualBoarding {
        organization_id: String,
        data: ManualBoardingData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationData {
    user_id: String,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualBoardingData {
    bus_number: String,
    user_id: String,
    action: BoardingAction,
}

/// Direct replies to a passenger connection. Broadcast `busUpdate` pushes
/// are produced by the session registry.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum PassengerServerMessage {
    Subscribed,
    BoardingDetected {
        data: BoardingDetectionResult,
    },
    BoardingResult {
        success: bool,
        message: String,
        action: BoardingAction,
    },
    Error {
        message: String,
    },
}

async fn send_json<T: Serialize>(tx: &mpsc::Sender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = tx.send(json).await;
        }
        Err(e) => warn!(error = %e, "Failed to serialize outbound message"),
    }
}

/// WebSocket endpoint for driver apps pushing GPS samples
pub async fn ws_driver(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_driver_socket(socket, state))
}

async fn handle_driver_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE_DEPTH);

    // Single writer for the socket: acks and registry pushes both go
    // through the channel.
    let forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    debug!(conn = %conn_id, "Driver connection opened");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let ack = match serde_json::from_str::<DriverLocationSample>(&text) {
                    Ok(sample) => {
                        let operation_id = sample.operation_id.clone();
                        match state.manager.ingest_driver_location(sample).await {
                            Ok(true) => {
                                // First accepted sample claims the driver
                                // slot for this operation.
                                state
                                    .manager
                                    .sessions()
                                    .register_driver(&operation_id, conn_id, tx.clone());
                                DriverAck::success("location updated")
                            }
                            Ok(false) => DriverAck::error("operation is not in progress"),
                            Err(e) => {
                                warn!(conn = %conn_id, error = %e, "Driver location ingest failed");
                                DriverAck::error(e.to_string())
                            }
                        }
                    }
                    Err(e) => DriverAck::error(format!("invalid location payload: {e}")),
                };
                send_json(&tx, &ack).await;
            }
            Ok(Message::Ping(_)) => {
                // Axum handles pong automatically
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    state.manager.sessions().unregister(conn_id);
    forward_task.abort();
    debug!(conn = %conn_id, "Driver connection closed");
}

/// WebSocket endpoint for passenger apps
pub async fn ws_passenger(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_passenger_socket(socket, state))
}

async fn handle_passenger_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE_DEPTH);

    let forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    debug!(conn = %conn_id, "Passenger connection opened");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<PassengerClientMessage>(&text)
            {
                Ok(PassengerClientMessage::Subscribe { organization_id }) => {
                    state
                        .manager
                        .sessions()
                        .register_passenger(conn_id, &organization_id, None, tx.clone());
                    send_json(&tx, &PassengerServerMessage::Subscribed).await;
                }
                Ok(PassengerClientMessage::Location {
                    organization_id,
                    data,
                }) => {
                    // A location message also subscribes the connection so
                    // the passenger receives bus updates without a separate
                    // subscribe round-trip.
                    state.manager.sessions().register_passenger(
                        conn_id,
                        &organization_id,
                        Some(data.user_id.clone()),
                        tx.clone(),
                    );
                    match state
                        .manager
                        .process_passenger_location(
                            &organization_id,
                            &data.user_id,
                            data.latitude,
                            data.longitude,
                        )
                        .await
                    {
                        Ok(Some(result)) => {
                            send_json(&tx, &PassengerServerMessage::BoardingDetected {
                                data: result,
                            })
                            .await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(conn = %conn_id, error = %e, "Passenger location processing failed");
                            send_json(&tx, &PassengerServerMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                        }
                    }
                }
                Ok(PassengerClientMessage::ManualBoarding {
                    organization_id,
                    data,
                }) => {
                    let reply = match state
                        .manager
                        .manual_boarding(
                            &organization_id,
                            &data.user_id,
                            &data.bus_number,
                            data.action,
                        )
                        .await
                    {
                        Ok(result) => PassengerServerMessage::BoardingResult {
                            success: result.successful,
                            message: result.message,
                            action: data.action,
                        },
                        Err(e) => PassengerServerMessage::BoardingResult {
                            success: false,
                            message: e.to_string(),
                            action: data.action,
                        },
                    };
                    send_json(&tx, &reply).await;
                }
                Err(e) => {
                    send_json(&tx, &PassengerServerMessage::Error {
                        message: format!("invalid message: {e}"),
                    })
                    .await;
                }
            },
            Ok(Message::Ping(_)) => {
                // Axum handles pong automatically
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    state.manager.sessions().unregister(conn_id);
    forward_task.abort();
    debug!(conn = %conn_id, "Passenger connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_wire_format() {
        let subscribe: PassengerClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","organizationId":"org-1"}"#).unwrap();
        assert!(matches!(
            subscribe,
            PassengerClientMessage::Subscribe { organization_id } if organization_id == "org-1"
        ));

        let location: PassengerClientMessage = serde_json::from_str(
            r#"{"type":"location","organizationId":"org-1","data":{"userId":"u1","latitude":37.5,"longitude":127.0}}"#,
        )
        .unwrap();
        match location {
            PassengerClientMessage::Location { data, .. } => {
                assert_eq!(data.user_id, "u1");
                assert_eq!(data.latitude, 37.5);
            }
            other => panic!("expected location, got {other:?}"),
        }

        let manual: PassengerClientMessage = serde_json::from_str(
            r#"{"type":"manualBoarding","organizationId":"org-1","data":{"busNumber":"1001","userId":"u1","action":"BOARD"}}"#,
        )
        .unwrap();
        match manual {
            PassengerClientMessage::ManualBoarding { data, .. } => {
                assert_eq!(data.bus_number, "1001");
                assert_eq!(data.action, BoardingAction::Board);
            }
            other => panic!("expected manualBoarding, got {other:?}"),
        }
    }

    #[test]
    fn server_messages_carry_the_expected_tags() {
        let subscribed = serde_json::to_string(&PassengerServerMessage::Subscribed).unwrap();
        assert_eq!(subscribed, r#"{"type":"subscribed"}"#);

        let result = serde_json::to_string(&PassengerServerMessage::BoardingResult {
            success: true,
            message: "boarded".into(),
            action: BoardingAction::Board,
        })
        .unwrap();
        assert!(result.contains("\"type\":\"boardingResult\""));
        assert!(result.contains("\"action\":\"BOARD\""));

        let ack = serde_json::to_string(&DriverAck::success("location updated")).unwrap();
        assert!(ack.contains("\"status\":\"success\""));
        assert!(ack.contains("\"timestamp\""));
    }
}
