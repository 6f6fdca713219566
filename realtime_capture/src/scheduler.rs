//! Periodic capture-and-submit loop for one camera.
//!
//! A session moves through `Idle -> Acquiring -> Waiting -> Capturing ->
//! InFlight -> Waiting` and back to `Idle` on [`CaptureScheduler::stop`].
//! At most one frame is outstanding: ticks that land while a frame is being
//! captured or is in flight are skipped without touching the camera. The
//! open camera and the tick timer live inside the active phases, so leaving
//! them releases both. Camera reads run on the blocking pool, never under
//! the session lock.
//!
//! Every session gets a fresh epoch. Results and ticks carry the epoch they
//! were started under and are dropped if the session has moved on.

use crate::camera::{CameraError, CameraSource, FrameStream};
use crate::client::{DetectionClientError, FrameSubmitter};
use detect_types::DetectionResult;
use parking_lot::Mutex;
use std::{
    mem,
    sync::{Arc, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(#[source] CameraError),
    #[error("Capture session is already active")]
    AlreadyActive,
    #[error("Capture session was stopped while the camera was being opened")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Starting,
    Waiting,
    Capturing,
    InFlight,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Waiting | SessionStatus::Capturing | SessionStatus::InFlight
        )
    }
}

/// What observers see of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub last_result: Option<DetectionResult>,
    pub last_error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            last_result: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was captured and handed to the submitter.
    Submitted,
    /// A capture or submission is still outstanding; nothing was captured.
    SkippedBusy,
    /// The frame could not be grabbed; the session keeps running.
    CaptureFailed,
    /// No active session, or the tick belongs to an ended one.
    Inactive,
}

/// The timer of a running session. Dropping it disarms the timer.
struct Armed {
    timer: JoinHandle<()>,
    epoch: u64,
}

impl Drop for Armed {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

struct Active<T> {
    stream: T,
    armed: Armed,
}

enum Phase<T> {
    Idle,
    Acquiring { epoch: u64 },
    Waiting(Active<T>),
    /// The stream is on the blocking pool for one read.
    Capturing(Armed),
    InFlight(Active<T>),
}

impl<T> Phase<T> {
    fn status(&self) -> SessionStatus {
        match self {
            Phase::Idle => SessionStatus::Idle,
            Phase::Acquiring { .. } => SessionStatus::Starting,
            Phase::Waiting(_) => SessionStatus::Waiting,
            Phase::Capturing(_) => SessionStatus::Capturing,
            Phase::InFlight(_) => SessionStatus::InFlight,
        }
    }

    fn is_acquiring(&self, epoch: u64) -> bool {
        matches!(self, Phase::Acquiring { epoch: current } if *current == epoch)
    }
}

struct Session<T> {
    phase: Phase<T>,
    last_result: Option<DetectionResult>,
    last_error: Option<String>,
    epochs: u64,
}

impl<T> Session<T> {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.phase.status(),
            last_result: self.last_result.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn next_epoch(&mut self) -> u64 {
        self.epochs += 1;
        self.epochs
    }

    /// Takes the timer back from a capture started under `epoch`.
    fn end_capture(&mut self, epoch: u64) -> Option<Armed> {
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Capturing(armed) if armed.epoch == epoch => Some(armed),
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// `InFlight -> Waiting`, only for the session that started the submission.
    fn finish_submission(&mut self, epoch: u64) -> bool {
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::InFlight(active) if active.armed.epoch == epoch => {
                self.phase = Phase::Waiting(active);
                true
            }
            other => {
                self.phase = other;
                false
            }
        }
    }
}

struct Shared<C: CameraSource, S> {
    camera: C,
    submitter: S,
    period: Duration,
    session: Mutex<Session<C::Stream>>,
    updates: watch::Sender<SessionSnapshot>,
}

impl<C: CameraSource, S: FrameSubmitter> Shared<C, S> {
    fn publish(&self, session: &Session<C::Stream>) {
        self.updates.send_replace(session.snapshot());
    }

    async fn tick(self: &Arc<Self>, epoch: Option<u64>) -> TickOutcome {
        let same_session = |current: u64| epoch.is_none_or(|e| e == current);

        let (mut stream, epoch) = {
            let mut session = self.session.lock();
            match mem::replace(&mut session.phase, Phase::Idle) {
                Phase::Waiting(Active { stream, armed }) if same_session(armed.epoch) => {
                    let epoch = armed.epoch;
                    session.phase = Phase::Capturing(armed);
                    self.publish(&session);
                    (stream, epoch)
                }
                other => {
                    let busy = match &other {
                        Phase::Capturing(armed) => same_session(armed.epoch),
                        Phase::InFlight(active) => same_session(active.armed.epoch),
                        _ => false,
                    };
                    session.phase = other;
                    if busy {
                        tracing::debug!("Previous frame still outstanding, skipping tick");
                        return TickOutcome::SkippedBusy;
                    }
                    return TickOutcome::Inactive;
                }
            }
        };

        let captured = tokio::task::spawn_blocking(move || {
            let frame = stream.capture_jpeg();
            (stream, frame)
        })
        .await;

        let mut session = self.session.lock();
        let (stream, captured) = match captured {
            Ok(pair) => pair,
            Err(e) => {
                // The stream went down with the capture thread.
                tracing::error!("Frame capture panicked: {}", e);
                if session.end_capture(epoch).is_some() {
                    session.last_result = None;
                    session.last_error = Some("camera capture failed unexpectedly".into());
                    self.publish(&session);
                }
                return TickOutcome::CaptureFailed;
            }
        };

        let Some(armed) = session.end_capture(epoch) else {
            drop(session);
            tracing::debug!(epoch, "Session ended during capture, releasing camera");
            tokio::task::spawn_blocking(move || drop(stream));
            return TickOutcome::Inactive;
        };

        let frame = match captured {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to capture frame: {}", e);
                session.phase = Phase::Waiting(Active { stream, armed });
                session.last_result = None;
                session.last_error = Some(e.to_string());
                self.publish(&session);
                return TickOutcome::CaptureFailed;
            }
        };

        session.phase = Phase::InFlight(Active { stream, armed });
        self.publish(&session);
        drop(session);

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = shared.submitter.submit(frame).await;
            shared.complete(epoch, outcome);
        });
        TickOutcome::Submitted
    }

    fn complete(&self, epoch: u64, outcome: Result<DetectionResult, DetectionClientError>) {
        let mut session = self.session.lock();
        if !session.finish_submission(epoch) {
            tracing::debug!(epoch, "Discarding detection result of an ended session");
            return;
        }

        match outcome {
            Ok(result) => {
                tracing::debug!("Received {} findings", result.detections.len());
                session.last_result = Some(result);
                session.last_error = None;
            }
            Err(e) => {
                tracing::warn!("Frame detection failed: {}", e);
                session.last_result = None;
                session.last_error = Some(e.to_string());
            }
        }
        self.publish(&session);
    }
}

fn arm_timer<C, S>(shared: Weak<Shared<C, S>>, period: Duration, epoch: u64) -> JoinHandle<()>
where
    C: CameraSource,
    S: FrameSubmitter,
{
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.tick(Some(epoch)).await == TickOutcome::Inactive {
                break;
            }
        }
    })
}

/// Resets a start that was abandoned while the camera was opening.
struct PendingStart<'a, C: CameraSource, S: FrameSubmitter> {
    shared: &'a Shared<C, S>,
    epoch: u64,
    settled: bool,
}

impl<C: CameraSource, S: FrameSubmitter> PendingStart<'_, C, S> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl<C: CameraSource, S: FrameSubmitter> Drop for PendingStart<'_, C, S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut session = self.shared.session.lock();
        if session.phase.is_acquiring(self.epoch) {
            session.phase = Phase::Idle;
            self.shared.publish(&session);
            tracing::info!("Capture session start abandoned");
        }
    }
}

/// Drives one camera: a frame every `period`, never more than one in flight.
///
/// Must be created and started inside a Tokio runtime. Dropping the scheduler
/// stops any running session.
pub struct CaptureScheduler<C: CameraSource, S: FrameSubmitter> {
    shared: Arc<Shared<C, S>>,
}

impl<C: CameraSource, S: FrameSubmitter> CaptureScheduler<C, S> {
    pub fn new(camera: C, submitter: S, period: Duration) -> Self {
        let (updates, _) = watch::channel(SessionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                camera,
                submitter,
                period: period.max(Duration::from_millis(1)),
                session: Mutex::new(Session {
                    phase: Phase::Idle,
                    last_result: None,
                    last_error: None,
                    epochs: 0,
                }),
                updates,
            }),
        }
    }

    /// Opens the camera and arms the timer. The first tick fires one period
    /// after the camera is open. Dropping the returned future before it
    /// resolves leaves the session idle.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let epoch = {
            let mut session = self.shared.session.lock();
            if !matches!(session.phase, Phase::Idle) {
                return Err(SchedulerError::AlreadyActive);
            }
            let epoch = session.next_epoch();
            session.phase = Phase::Acquiring { epoch };
            session.last_result = None;
            session.last_error = None;
            self.shared.publish(&session);
            epoch
        };

        let pending = PendingStart {
            shared: &self.shared,
            epoch,
            settled: false,
        };
        let acquired = self.shared.camera.acquire().await;
        pending.settle();

        let mut session = self.shared.session.lock();
        if !session.phase.is_acquiring(epoch) {
            drop(session);
            drop(acquired);
            tracing::info!("Capture session stopped while the camera was opening");
            return Err(SchedulerError::Stopped);
        }

        match acquired {
            Ok(stream) => {
                let timer = arm_timer(Arc::downgrade(&self.shared), self.shared.period, epoch);
                session.phase = Phase::Waiting(Active {
                    stream,
                    armed: Armed { timer, epoch },
                });
                self.shared.publish(&session);
                tracing::info!(
                    period_ms = self.shared.period.as_millis() as u64,
                    "Capture session started"
                );
                Ok(())
            }
            Err(e) => {
                session.phase = Phase::Idle;
                session.last_error = Some(e.to_string());
                self.shared.publish(&session);
                tracing::error!("Failed to open camera: {}", e);
                Err(SchedulerError::CameraUnavailable(e))
            }
        }
    }

    /// Ends the session. The timer is disarmed before this returns and the
    /// camera is released, or, if a frame is being read, released on the
    /// blocking pool once that read ends. An outstanding submission is left
    /// to finish and its result is discarded.
    pub fn stop(&self) {
        let released = {
            let mut session = self.shared.session.lock();
            let previous = mem::replace(&mut session.phase, Phase::Idle);
            session.last_result = None;
            session.last_error = None;
            self.shared.publish(&session);
            previous
        };

        match &released {
            Phase::Idle => {}
            Phase::Acquiring { .. } => tracing::info!("Capture session cancelled during start"),
            Phase::Waiting(_) | Phase::Capturing(_) | Phase::InFlight(_) => {
                tracing::info!("Capture session stopped")
            }
        }
        drop(released);
    }

    /// Runs one tick now, as the timer would.
    pub async fn tick(&self) -> TickOutcome {
        self.shared.tick(None).await
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.session.lock().phase.status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.session.lock().snapshot()
    }

    /// Receives a snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.updates.subscribe()
    }
}

impl<C: CameraSource, S: FrameSubmitter> Drop for CaptureScheduler<C, S> {
    fn drop(&mut self) {
        self.stop();
    }
}
