use crate::config::WorkerConfig;
use crate::ingest::ImagePayload;
use detect_types::{DetectionResult, FindingError};
use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("all {capacity} workers are busy and {queued} requests are already waiting")]
    PoolSaturated { capacity: usize, queued: usize },
    #[error("no worker became free within {0:?}")]
    QueueTimeout(Duration),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker stdio was not captured")]
    MissingPipe,
    #[error("worker did not accept its input within {0:?}")]
    InputTimeout(Duration),
    #[error("worker I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("worker did not finish within {0:?}")]
    Timeout(Duration),
    #[error("worker exited with {status}")]
    WorkerFailure { status: ExitStatus, stderr: String },
    #[error("worker output is not a detection result: {0}")]
    MalformedOutput(#[from] serde_json::Error),
    #[error("worker output failed validation: {0}")]
    InvalidOutput(#[from] FindingError),
}

/// Executable plus the fixed arguments that make up its entry path, e.g.
/// `python3 scripts/detect.py`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl From<&WorkerConfig> for WorkerCommand {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

impl WorkerCommand {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerTimeouts {
    pub queue: Duration,
    pub write: Duration,
    pub run: Duration,
}

/// Bounded set of worker slots. Each detection spawns a fresh process, but no
/// more than `capacity` processes run at once and at most `max_queued`
/// requests wait for a slot.
#[derive(Debug)]
pub struct WorkerPool {
    command: WorkerCommand,
    permits: Arc<Semaphore>,
    capacity: usize,
    max_queued: usize,
    queued: AtomicUsize,
    timeouts: WorkerTimeouts,
}

/// Keeps `queued` accurate even when the waiting future is dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(command: WorkerCommand, capacity: usize, max_queued: usize, timeouts: WorkerTimeouts) -> Self {
        let capacity = capacity.max(1);
        Self {
            command,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_queued,
            queued: AtomicUsize::new(0),
            timeouts,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            WorkerCommand::from(config),
            config.max_concurrent,
            config.max_queued,
            WorkerTimeouts {
                queue: config.queue_timeout(),
                write: config.write_timeout(),
                run: config.run_timeout(),
            },
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, BridgeError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let queued = self.queued.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot(&self.queued);
        if queued >= self.max_queued {
            tracing::warn!(capacity = self.capacity, queued, "Rejecting detection, worker queue is full");
            return Err(BridgeError::PoolSaturated {
                capacity: self.capacity,
                queued,
            });
        }

        match timeout(self.timeouts.queue, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(BridgeError::PoolSaturated {
                capacity: self.capacity,
                queued,
            }),
            Err(_) => {
                tracing::warn!("Timed out waiting {:?} for a free worker", self.timeouts.queue);
                Err(BridgeError::QueueTimeout(self.timeouts.queue))
            }
        }
    }

    /// Runs one worker process over `payload` and returns its parsed result.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn detect(&self, payload: &ImagePayload) -> Result<DetectionResult, BridgeError> {
        let _permit = self.admit().await?;
        let output = run_worker(&self.command, payload.as_bytes(), self.timeouts).await?;
        interpret(output)
    }
}

/// What a finished worker left behind.
#[derive(Debug)]
pub struct WorkerOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub async fn run_worker(
    command: &WorkerCommand,
    input: &[u8],
    timeouts: WorkerTimeouts,
) -> Result<WorkerOutput, BridgeError> {
    let mut child = command.command().spawn().map_err(BridgeError::Spawn)?;
    tracing::debug!(pid = child.id(), program = %command.program.display(), "Spawned worker");

    let stdin = child.stdin.take().ok_or(BridgeError::MissingPipe)?;
    let stdout = child.stdout.take().ok_or(BridgeError::MissingPipe)?;
    let stderr = child.stderr.take().ok_or(BridgeError::MissingPipe)?;

    // Any failure on one pipe ends the exchange; the child is killed below
    // instead of waiting for it to close the others.
    let exchange = async {
        let ((), stdout, stderr) = tokio::try_join!(
            write_input(stdin, input, timeouts.write),
            drain(stdout),
            drain(stderr),
        )?;
        let status = child.wait().await?;
        Ok::<_, BridgeError>(WorkerOutput {
            status,
            stdout,
            stderr,
        })
    };

    let outcome = timeout(timeouts.run, exchange).await;
    let error = match outcome {
        Ok(Ok(output)) => return Ok(output),
        Ok(Err(e)) => e,
        Err(_) => {
            tracing::error!("Worker exceeded {:?}, killing it", timeouts.run);
            BridgeError::Timeout(timeouts.run)
        }
    };

    if let Err(e) = child.kill().await {
        tracing::debug!("Failed to kill worker: {}", e);
    }
    Err(error)
}

/// Writes the whole payload then closes stdin so the worker sees end-of-input.
/// `write_all` only completes once the pipe has taken every byte, so a slow
/// reader applies backpressure here instead of buffering in memory.
async fn write_input(mut stdin: ChildStdin, input: &[u8], limit: Duration) -> Result<(), BridgeError> {
    let write = async {
        stdin.write_all(input).await?;
        stdin.shutdown().await
    };
    match timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        // The worker may legitimately stop reading early; its exit status decides.
        Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!("Worker closed its input early");
            Ok(())
        }
        Ok(Err(e)) => Err(BridgeError::Io(e)),
        Err(_) => {
            tracing::error!("Worker did not accept its input within {:?}", limit);
            Err(BridgeError::InputTimeout(limit))
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Result<Vec<u8>, BridgeError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

pub fn interpret(output: WorkerOutput) -> Result<DetectionResult, BridgeError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        tracing::error!(code = ?output.status.code(), "Worker failed: {}", stderr.trim_end());
        return Err(BridgeError::WorkerFailure {
            status: output.status,
            stderr,
        });
    }

    let result: DetectionResult = serde_json::from_slice(&output.stdout).map_err(|e| {
        tracing::error!("Worker produced unparsable output: {}", e);
        BridgeError::MalformedOutput(e)
    })?;
    result.validate()?;

    tracing::debug!("Worker returned {} detections", result.detections.len());
    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn timeouts() -> WorkerTimeouts {
        WorkerTimeouts {
            queue: Duration::from_millis(200),
            write: Duration::from_secs(5),
            run: Duration::from_secs(5),
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: None,
        }
    }

    fn payload(text: &str) -> ImagePayload {
        ImagePayload::from_base64(text.to_string())
    }

    #[tokio::test]
    async fn test_worker_receives_payload_on_stdin() {
        // Echo stdin back inside the image field.
        let command = sh(r#"read -r img; printf '{"processed_image_base64":"%s","detections":[]}' "$img""#);
        let pool = WorkerPool::new(command, 1, 0, timeouts());

        let result = pool.detect(&payload("aGVsbG8=")).await.unwrap();
        assert_eq!(result.processed_image_base64, "aGVsbG8=");
        assert!(result.detections.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let pool = WorkerPool::new(sh("cat >/dev/null; printf boom >&2; exit 2"), 1, 0, timeouts());

        match pool.detect(&payload("aGk=")).await {
            Err(BridgeError::WorkerFailure { status, stderr }) => {
                assert_eq!(status.code(), Some(2));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected worker failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stdout_is_ignored_when_exit_is_nonzero() {
        let script = r#"printf '{"processed_image_base64":"x","detections":[]}'; exit 1"#;
        let pool = WorkerPool::new(sh(script), 1, 0, timeouts());

        assert!(matches!(
            pool.detect(&payload("aGk=")).await,
            Err(BridgeError::WorkerFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_unparsable_output_is_malformed() {
        let pool = WorkerPool::new(sh("cat >/dev/null; echo not-json"), 1, 0, timeouts());

        assert!(matches!(
            pool.detect(&payload("aGk=")).await,
            Err(BridgeError::MalformedOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_rejected() {
        let script = r#"cat >/dev/null; printf '{"processed_image_base64":"x","detections":[{"label":"sleeping","confidence":1.7,"description":"d"}]}'"#;
        let pool = WorkerPool::new(sh(script), 1, 0, timeouts());

        assert!(matches!(
            pool.detect(&payload("aGk=")).await,
            Err(BridgeError::InvalidOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_large_payload_with_chatty_stderr_does_not_stall() {
        // 1 MiB in, 256 KiB of diagnostics out: both pipes exceed their OS buffers.
        let script = r#"head -c 262144 /dev/zero >&2; cat >/dev/null; printf '{"processed_image_base64":"","detections":[]}'"#;
        let pool = WorkerPool::new(sh(script), 1, 0, timeouts());

        let big = "A".repeat(1024 * 1024);
        assert!(pool.detect(&payload(&big)).await.is_ok());
    }

    #[tokio::test]
    async fn test_worker_that_ignores_input_is_judged_by_exit_status() {
        let script = r#"printf '{"processed_image_base64":"","detections":[]}'"#;
        let pool = WorkerPool::new(sh(script), 1, 0, timeouts());

        let big = "A".repeat(1024 * 1024);
        assert!(pool.detect(&payload(&big)).await.is_ok());
    }

    #[tokio::test]
    async fn test_hung_worker_is_killed_at_run_timeout() {
        let mut limits = timeouts();
        limits.run = Duration::from_millis(200);
        let pool = WorkerPool::new(sh("sleep 30"), 1, 0, limits);

        let started = Instant::now();
        assert!(matches!(
            pool.detect(&payload("aGk=")).await,
            Err(BridgeError::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_worker_that_never_reads_hits_input_timeout() {
        let limits = WorkerTimeouts {
            queue: Duration::from_millis(200),
            write: Duration::from_millis(200),
            run: Duration::from_secs(3),
        };
        let pool = WorkerPool::new(sh("sleep 30"), 1, 0, limits);

        let started = Instant::now();
        let big = "A".repeat(1024 * 1024);
        assert!(matches!(
            pool.detect(&payload(&big)).await,
            Err(BridgeError::InputTimeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.active(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_detection_kills_its_worker() {
        let pid_file = std::env::temp_dir().join(format!("detect-worker-pid-{}", std::process::id()));
        let _ = std::fs::remove_file(&pid_file);
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let pool = WorkerPool::new(sh(&script), 1, 0, timeouts());

        let abandoned = timeout(Duration::from_millis(500), pool.detect(&payload("aGk="))).await;
        assert!(abandoned.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let _ = std::fs::remove_file(&pid_file);

        // Gone, or at least dead and waiting to be reaped.
        let stat = format!("/proc/{pid}/stat");
        let mut alive = true;
        for _ in 0..100 {
            alive = match std::fs::read_to_string(&stat) {
                Ok(line) => !line.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')),
                Err(_) => false,
            };
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "worker {pid} outlived its request");
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_spawn_error() {
        let command = WorkerCommand {
            program: "/nonexistent/detect_worker".into(),
            args: vec![],
            working_dir: None,
        };
        let pool = WorkerPool::new(command, 1, 0, timeouts());

        assert!(matches!(
            pool.detect(&payload("aGk=")).await,
            Err(BridgeError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn test_full_pool_rejects_when_queue_is_disabled() {
        let pool = Arc::new(WorkerPool::new(sh("sleep 1; cat >/dev/null"), 1, 0, timeouts()));

        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.detect(&payload("aGk=")).await })
        };
        while pool.active() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(
            pool.detect(&payload("aGk=")).await,
            Err(BridgeError::PoolSaturated { capacity: 1, .. })
        ));
        assert_eq!(pool.queued(), 0);
        busy.abort();
    }

    #[tokio::test]
    async fn test_queued_request_times_out_waiting_for_a_slot() {
        let pool = Arc::new(WorkerPool::new(sh("sleep 2; cat >/dev/null"), 1, 4, timeouts()));

        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.detect(&payload("aGk=")).await })
        };
        while pool.active() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(
            pool.detect(&payload("aGk=")).await,
            Err(BridgeError::QueueTimeout(_))
        ));
        assert_eq!(pool.queued(), 0);
        busy.abort();
    }
}
