use crate::{
    bridge::BridgeError,
    ingest::{self, IngestError},
    server::SharedState,
};
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use detect_types::{DetectionResult, ErrorBody};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl DetectError {
    pub fn outcome(&self) -> &'static str {
        match self {
            DetectError::Ingest(IngestError::PayloadTooLarge { .. }) => "payload_too_large",
            DetectError::Ingest(_) => "input_error",
            DetectError::Bridge(e) => bridge_outcome(e),
        }
    }

    fn status_and_body(&self) -> (StatusCode, ErrorBody) {
        match self {
            DetectError::Ingest(e @ (IngestError::MissingImageFile | IngestError::MissingImageBase64)) => {
                (StatusCode::BAD_REQUEST, ErrorBody::new(e.to_string()))
            }
            DetectError::Ingest(e @ IngestError::UnsupportedContentKind) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, ErrorBody::new(e.to_string()))
            }
            DetectError::Ingest(e @ IngestError::PayloadTooLarge { limit }) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorBody::with_details(e.to_string(), format!("limit is {limit} bytes of base64")),
            ),
            DetectError::Ingest(e @ IngestError::InvalidBody(details)) => (
                StatusCode::BAD_REQUEST,
                ErrorBody::with_details(e.to_string(), details.clone()),
            ),
            DetectError::Bridge(e @ (BridgeError::PoolSaturated { .. } | BridgeError::QueueTimeout(_))) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::with_details("Detection workers are busy", e.to_string()),
            ),
            DetectError::Bridge(BridgeError::WorkerFailure { stderr, .. }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::with_details("Error processing image with worker", stderr.clone()),
            ),
            DetectError::Bridge(e @ (BridgeError::MalformedOutput(_) | BridgeError::InvalidOutput(_))) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::with_details("Invalid output from worker", e.to_string()),
            ),
            DetectError::Bridge(e @ (BridgeError::Timeout(_) | BridgeError::InputTimeout(_))) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::with_details("Worker timed out", e.to_string()),
            ),
            DetectError::Bridge(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::with_details("Internal server error", e.to_string()),
            ),
        }
    }
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[instrument(skip(state, request))]
pub async fn detect(
    State(state): State<SharedState>,
    request: Request,
) -> Result<Json<DetectionResult>, DetectError> {
    state.metrics.record_request("/detect");

    let result = run_detection(&state, request).await;
    match &result {
        Ok(result) => {
            state.metrics.record_detection("success");
            tracing::info!("Detection returned {} findings", result.detections.len());
        }
        Err(e) => {
            state.metrics.record_detection(e.outcome());
            tracing::warn!(outcome = e.outcome(), "Detection failed: {}", e);
        }
    }
    result.map(Json)
}

async fn run_detection(state: &SharedState, request: Request) -> Result<DetectionResult, DetectError> {
    let payload = ingest::normalize(request, state.limits.max_payload_bytes).await?;

    let started = Instant::now();
    let result = state.worker_pool.detect(&payload).await;
    let outcome = match &result {
        Ok(_) => "success",
        Err(e) => bridge_outcome(e),
    };
    state
        .metrics
        .record_worker_duration(started.elapsed().as_millis() as u64, outcome);

    result.map_err(DetectError::from)
}

fn bridge_outcome(error: &BridgeError) -> &'static str {
    match error {
        BridgeError::PoolSaturated { .. } | BridgeError::QueueTimeout(_) => "rejected",
        BridgeError::WorkerFailure { .. } => "worker_failure",
        BridgeError::MalformedOutput(_) | BridgeError::InvalidOutput(_) => "malformed_output",
        BridgeError::Timeout(_) | BridgeError::InputTimeout(_) => "timeout",
        _ => "internal_error",
    }
}
