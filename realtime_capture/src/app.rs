use crate::camera::CameraSource;
use crate::client::FrameSubmitter;
use crate::scheduler::{CaptureScheduler, SchedulerError, SessionSnapshot, SessionStatus};
use std::future::Future;
use tokio::{
    signal,
    sync::watch,
    time::{sleep, Duration},
};

/// Starts the scheduler, retrying with jittered backoff while the camera is
/// unavailable. Any other error is returned at once.
pub async fn start_with_retry<C, S>(
    scheduler: &CaptureScheduler<C, S>,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<(), SchedulerError>
where
    C: CameraSource,
    S: FrameSubmitter,
{
    let mut retry_delay = initial_delay;
    let max_retry_delay = Duration::from_secs(5);
    let mut retry_count = 0;

    loop {
        match scheduler.start().await {
            Ok(()) => return Ok(()),
            Err(SchedulerError::CameraUnavailable(e)) if retry_count < max_retries => {
                retry_count += 1;
                tracing::warn!(
                    "Camera unavailable ({}), retrying {}/{}",
                    e,
                    retry_count,
                    max_retries
                );
                let jitter = rand::random::<f32>() * 0.2 + 0.9;
                sleep(retry_delay.mul_f32(jitter)).await;
                retry_delay = (retry_delay * 2).min(max_retry_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Logs each completed detection until the scheduler goes away.
pub async fn report_detections(mut updates: watch::Receiver<SessionSnapshot>) {
    let mut previous = updates.borrow_and_update().status;
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        if previous == SessionStatus::InFlight && snapshot.status == SessionStatus::Waiting {
            log_snapshot(&snapshot);
        }
        previous = snapshot.status;
    }
}

fn log_snapshot(snapshot: &SessionSnapshot) {
    if let Some(error) = &snapshot.last_error {
        tracing::warn!("Detection failed: {}", error);
    }
    if let Some(result) = &snapshot.last_result {
        for finding in &result.detections {
            tracing::info!(
                label = %finding.label,
                confidence = finding.confidence,
                bbox = ?finding.bbox,
                "{}",
                finding.description
            );
        }
    }
}

/// Runs a capture session until `shutdown` resolves, then stops it.
pub async fn run_session<C, S>(
    scheduler: &CaptureScheduler<C, S>,
    max_retries: u32,
    initial_delay: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<(), SchedulerError>
where
    C: CameraSource,
    S: FrameSubmitter,
{
    let reporter = tokio::spawn(report_detections(scheduler.subscribe()));
    tokio::pin!(shutdown);

    let outcome = tokio::select! {
        started = start_with_retry(scheduler, max_retries, initial_delay) => match started {
            Ok(()) => {
                (&mut shutdown).await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        _ = &mut shutdown => Ok(()),
    };

    if outcome.is_ok() {
        tracing::info!("Shutdown signal received, stopping capture session.");
    }
    scheduler.stop();
    reporter.abort();

    outcome
}

#[cfg(feature = "opencv")]
pub async fn start_app(config: crate::config::Config) -> anyhow::Result<()> {
    use crate::camera::OpenCvCamera;
    use crate::client::HttpDetectionClient;

    let client = HttpDetectionClient::new(&config.endpoint, config.request_timeout())?;
    tracing::info!(endpoint = client.endpoint(), "Submitting frames for detection");

    let scheduler = CaptureScheduler::new(
        OpenCvCamera::new(config.camera.device_index),
        client,
        config.camera.interval(),
    );

    run_session(
        &scheduler,
        config.camera.start_retries,
        config.camera.start_backoff(),
        shutdown_signal(),
    )
    .await?;

    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
