use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, FromRequest, Multipart, Request},
    http::{header, StatusCode},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

pub const IMAGE_FIELD: &str = "image";
pub const IMAGE_BASE64_FIELD: &str = "image_base64";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("No image file provided")]
    MissingImageFile,
    #[error("No image_base64 provided in JSON body")]
    MissingImageBase64,
    #[error("Unsupported content type")]
    UnsupportedContentKind,
    #[error("Image payload too large")]
    PayloadTooLarge { limit: usize },
    #[error("Invalid request body")]
    InvalidBody(String),
}

/// How the request body is framed, decided from `Content-Type` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Multipart,
    Json,
}

impl ContentKind {
    pub fn from_header(content_type: Option<&str>) -> Result<Self, IngestError> {
        let content_type = content_type
            .ok_or(IngestError::UnsupportedContentKind)?
            .to_ascii_lowercase();
        if content_type.contains("multipart/form-data") {
            Ok(ContentKind::Multipart)
        } else if content_type.contains("application/json") {
            Ok(ContentKind::Json)
        } else {
            Err(IngestError::UnsupportedContentKind)
        }
    }
}

/// Base64 text of one image, as handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload(String);

impl ImagePayload {
    pub fn from_base64(encoded: String) -> Self {
        Self(encoded)
    }

    pub fn from_raw(bytes: &[u8]) -> Self {
        Self(STANDARD.encode(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Turns a `POST /detect` request into the payload for a worker. The content
/// kind is checked before any of the body is read.
pub async fn normalize(request: Request, max_payload_bytes: usize) -> Result<ImagePayload, IngestError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let payload = match ContentKind::from_header(content_type)? {
        ContentKind::Multipart => from_multipart(request, max_payload_bytes).await?,
        ContentKind::Json => from_json(request, max_payload_bytes).await?,
    };

    if payload.len() > max_payload_bytes {
        return Err(IngestError::PayloadTooLarge {
            limit: max_payload_bytes,
        });
    }
    Ok(payload)
}

async fn from_multipart(request: Request, limit: usize) -> Result<ImagePayload, IngestError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| IngestError::InvalidBody(rejection.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let bytes = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
        if bytes.is_empty() {
            return Err(IngestError::MissingImageFile);
        }
        return Ok(ImagePayload::from_raw(&bytes));
    }
    Err(IngestError::MissingImageFile)
}

fn multipart_error(error: MultipartError, limit: usize) -> IngestError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        IngestError::PayloadTooLarge { limit }
    } else {
        IngestError::InvalidBody(error.body_text())
    }
}

async fn from_json(request: Request, limit: usize) -> Result<ImagePayload, IngestError> {
    let body = Bytes::from_request(request, &()).await.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            IngestError::PayloadTooLarge { limit }
        } else {
            IngestError::InvalidBody(rejection.body_text())
        }
    })?;

    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| IngestError::InvalidBody(e.to_string()))?;

    match value.get(IMAGE_BASE64_FIELD).and_then(|v| v.as_str()) {
        Some(encoded) if !encoded.is_empty() => Ok(ImagePayload::from_base64(encoded.to_string())),
        _ => Err(IngestError::MissingImageBase64),
    }
}
