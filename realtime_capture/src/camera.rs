use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    Unavailable(String),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(String),
    #[error("Camera returned an empty frame")]
    EmptyFrame,
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(String),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

/// Something that can hand out exclusive access to a camera.
#[async_trait]
pub trait CameraSource: Send + Sync + 'static {
    type Stream: FrameStream;

    /// Opens the device. The returned stream owns it until dropped.
    async fn acquire(&self) -> Result<Self::Stream, CameraError>;
}

/// An open camera. Dropping it releases the device.
pub trait FrameStream: Send + 'static {
    /// Grabs the current frame as JPEG bytes.
    fn capture_jpeg(&mut self) -> Result<Vec<u8>, CameraError>;
}

#[cfg(feature = "opencv")]
pub use self::opencv_backend::{OpenCvCamera, OpenCvStream};

#[cfg(feature = "opencv")]
mod opencv_backend {
    use super::{CameraError, CameraSource, FrameStream};
    use async_trait::async_trait;
    use opencv::{
        core::{Mat, Vector},
        imgcodecs,
        prelude::*,
        videoio,
    };

    #[derive(Debug, Clone)]
    pub struct OpenCvCamera {
        device_index: i32,
    }

    impl OpenCvCamera {
        pub fn new(device_index: i32) -> Self {
            Self { device_index }
        }
    }

    pub struct OpenCvStream {
        capture: videoio::VideoCapture,
    }

    #[async_trait]
    impl CameraSource for OpenCvCamera {
        type Stream = OpenCvStream;

        async fn acquire(&self) -> Result<OpenCvStream, CameraError> {
            let device_index = self.device_index;
            let capture = tokio::task::spawn_blocking(move || {
                videoio::VideoCapture::new(device_index, videoio::CAP_ANY)
            })
            .await
            .map_err(|e| CameraError::Unavailable(e.to_string()))?
            .map_err(|e| CameraError::Unavailable(e.to_string()))?;

            if !capture.is_opened()? {
                return Err(CameraError::Unavailable(format!(
                    "device {} could not be opened",
                    device_index
                )));
            }
            tracing::info!(device_index, "Camera opened");
            Ok(OpenCvStream { capture })
        }
    }

    impl FrameStream for OpenCvStream {
        fn capture_jpeg(&mut self) -> Result<Vec<u8>, CameraError> {
            let mut frame = Mat::default();
            let grabbed = self
                .capture
                .read(&mut frame)
                .map_err(|e| CameraError::ReadFrameFailed(e.to_string()))?;
            if !grabbed || frame.empty() {
                return Err(CameraError::EmptyFrame);
            }

            let mut buf = Vector::<u8>::new();
            imgcodecs::imencode(".jpg", &frame, &mut buf, &Vector::new())
                .map_err(|e| CameraError::EncodeFrameFailed(e.to_string()))?;
            Ok(buf.into())
        }
    }

    impl Drop for OpenCvStream {
        fn drop(&mut self) {
            if let Err(e) = self.capture.release() {
                tracing::warn!("Failed to release camera: {}", e);
            } else {
                tracing::info!("Camera released");
            }
        }
    }
}
