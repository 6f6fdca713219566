pub mod app;
pub mod camera;
pub mod client;
pub mod config;
pub mod scheduler;

#[cfg(feature = "opencv")]
pub use app::start_app;
pub use scheduler::{CaptureScheduler, SessionSnapshot, SessionStatus};
