use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    workers_active: usize,
    workers_queued: usize,
    workers_capacity: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let pool = &state.worker_pool;
    Json(Status {
        status: "Available".into(),
        workers_active: pool.active(),
        workers_queued: pool.queued(),
        workers_capacity: pool.capacity(),
    })
}
