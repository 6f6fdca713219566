use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use detect_types::{DetectRequest, DetectionResult, ErrorBody, FindingError};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DetectionClientError {
    #[error("Failed to reach detection service: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("Detection service returned an invalid result: {0}")]
    InvalidResult(#[from] FindingError),
}

/// Sends one captured frame for detection.
#[async_trait]
pub trait FrameSubmitter: Send + Sync + 'static {
    async fn submit(&self, jpeg: Vec<u8>) -> Result<DetectionResult, DetectionClientError>;
}

/// Posts frames as `{"image_base64": ...}` to the detection endpoint.
pub struct HttpDetectionClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetectionClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DetectionClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl FrameSubmitter for HttpDetectionClient {
    #[instrument(skip(self, jpeg), fields(bytes = jpeg.len()))]
    async fn submit(&self, jpeg: Vec<u8>) -> Result<DetectionResult, DetectionClientError> {
        let request = DetectRequest {
            image_base64: STANDARD.encode(&jpeg),
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            // Prefer the service's own message, fall back to the status line.
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => format!(
                    "Error: {}",
                    status.canonical_reason().unwrap_or("request failed")
                ),
            };
            return Err(DetectionClientError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let result = response.json::<DetectionResult>().await?;
        result.validate()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/detect")
    }

    fn client(endpoint: String) -> HttpDetectionClient {
        HttpDetectionClient::new(endpoint, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_frame_is_sent_as_base64_json() {
        let router = Router::new().route(
            "/detect",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "processed_image_base64": body["image_base64"],
                    "detections": [
                        { "label": "attentive", "confidence": 0.92, "description": "Student appears attentive" }
                    ]
                }))
            }),
        );
        let endpoint = serve(router).await;

        let result = client(endpoint).submit(b"hello".to_vec()).await.unwrap();

        assert_eq!(result.processed_image_base64, "aGVsbG8=");
        assert_eq!(result.detections[0].label, "attentive");
        assert_eq!(result.detections[0].bbox, None);
    }

    #[tokio::test]
    async fn test_error_body_message_is_surfaced() {
        let router = Router::new().route(
            "/detect",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Error processing image with worker", "details": "boom" })),
                )
            }),
        );
        let endpoint = serve(router).await;

        let error = client(endpoint).submit(vec![1, 2, 3]).await.unwrap_err();

        match error {
            DetectionClientError::Rejected { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "Error processing image with worker");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_json_error_falls_back_to_status_reason() {
        let router = Router::new().route(
            "/detect",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream went away") }),
        );
        let endpoint = serve(router).await;

        let error = client(endpoint).submit(vec![1]).await.unwrap_err();

        assert_eq!(error.to_string(), "Error: Bad Gateway");
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_rejected() {
        let router = Router::new().route(
            "/detect",
            post(|| async {
                Json(json!({
                    "processed_image_base64": "",
                    "detections": [{ "label": "sleeping", "confidence": 7.8, "description": "d" }]
                }))
            }),
        );
        let endpoint = serve(router).await;

        let error = client(endpoint).submit(vec![1]).await.unwrap_err();

        assert!(matches!(error, DetectionClientError::InvalidResult(_)));
    }
}
