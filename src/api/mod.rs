pub mod drive;
pub mod operations;
pub mod status;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::tracking::TrackingManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TrackingManager>,
}

pub fn router(manager: Arc<TrackingManager>) -> Router {
    let state = AppState { manager };
    Router::new()
        .route("/health", get(status::health))
        .route("/status/{organization_id}", get(status::organization_status))
        .route("/operations/{organization_id}", get(operations::list_operations))
        .route(
            "/operations/{organization_id}/driver/{driver_id}",
            get(operations::driver_operations),
        )
        .route("/drive/start", post(drive::start_drive))
        .route("/drive/end", post(drive::end_drive))
        .route("/ws/driver", get(ws::ws_driver))
        .route("/ws/passenger", get(ws::ws_passenger))
        .with_state(state)
}
