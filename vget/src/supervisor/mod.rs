//! Child-process supervision: spawn, monitor, classify, retry.
//!
//! The external binaries this crate drives can hang indefinitely on a dead
//! connection without exiting or printing an error, so supervision watches
//! for silence as much as for failure. Every exit path, including caller
//! cancellation, leaves no child process behind.

mod classify;
mod output_reader;
mod progress;

pub use classify::FailureClassifier;
pub use output_reader::RecordReader;
pub use progress::{ProgressEvent, decode as decode_progress};

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::CommandSpec;
use crate::config::{FailurePatterns, SupervisorLimits};
use crate::error::{OperationError, Result};
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};

/// Diagnostic lines kept per attempt; older lines rotate out.
const DIAGNOSTIC_CAPACITY: usize = 200;

/// Outcome of one child-process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

/// Record of one child-process invocation. Never persisted beyond the
/// supervision call; returned for observability.
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub command: Vec<String>,
    /// 1-based attempt number within one supervision call.
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Success payload of a supervision call.
#[derive(Debug)]
pub struct ExecutionReport {
    pub attempts: Vec<ExecutionAttempt>,
    /// Non-progress output lines captured from the successful attempt.
    pub captured_output: Vec<String>,
}

impl ExecutionReport {
    /// Captured output joined into one block of text.
    pub fn output_text(&self) -> String {
        self.captured_output.join("\n")
    }
}

/// Supervises child processes on behalf of the orchestrator.
///
/// Consults the target's circuit breaker before every spawn, absorbs
/// retryable failures up to the retry policy's budget, and guarantees child
/// cleanup on every exit path.
pub struct ProcessSupervisor {
    retry: RetryPolicy,
    limits: SupervisorLimits,
    classifier: FailureClassifier,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ProcessSupervisor {
    pub fn new(
        retry: RetryPolicy,
        limits: SupervisorLimits,
        patterns: &FailurePatterns,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            retry,
            limits,
            classifier: FailureClassifier::new(patterns),
            breakers,
        }
    }

    /// Run `command` against `target`, retrying transient failures.
    ///
    /// Progress events are forwarded to `observer` when one is supplied.
    /// Retryable failures only surface wrapped in
    /// [`OperationError::MaxRetriesExceeded`]; everything else propagates on
    /// first occurrence.
    pub async fn run(
        &self,
        command: &CommandSpec,
        target: &str,
        observer: Option<mpsc::Sender<ProgressEvent>>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let breaker = self.breakers.get(target);
        let mut attempts = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if !breaker.is_allowed() {
                return Err(OperationError::CircuitOpen {
                    target: target.to_string(),
                    retry_after: breaker.retry_after(),
                });
            }

            let started_at = Utc::now();
            debug!(command = %command, attempt = attempt + 1, target, "spawning child");

            match self.run_attempt(command, observer.clone(), cancel).await {
                Ok(captured_output) => {
                    breaker.record_success();
                    attempts.push(ExecutionAttempt {
                        command: command.to_vec(),
                        attempt_number: attempt + 1,
                        started_at,
                        outcome: AttemptOutcome::Success,
                    });
                    return Ok(ExecutionReport {
                        attempts,
                        captured_output,
                    });
                }
                Err(error) => {
                    if error.counts_against_breaker() {
                        breaker.record_failure();
                    }
                    let retryable = error.is_retryable();
                    attempts.push(ExecutionAttempt {
                        command: command.to_vec(),
                        attempt_number: attempt + 1,
                        started_at,
                        outcome: if retryable {
                            AttemptOutcome::RetryableFailure(error.to_string())
                        } else {
                            AttemptOutcome::FatalFailure(error.to_string())
                        },
                    });

                    if !self.retry.permits_retry(&error, attempt) {
                        if retryable {
                            return Err(OperationError::MaxRetriesExceeded {
                                attempts: attempt + 1,
                                last: Box::new(error),
                            });
                        }
                        return Err(error);
                    }

                    let delay = self.retry.backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        wait = ?delay,
                        error = %error,
                        "retrying after transient failure"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(OperationError::Fatal("operation cancelled".into()));
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        command: &CommandSpec,
        observer: Option<mpsc::Sender<ProgressEvent>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let grace = Duration::from_millis(self.limits.termination_grace_ms.max(100));
        let stall = Duration::from_secs(self.limits.stall_timeout_secs.max(1));
        let check = Duration::from_millis(self.limits.stall_check_interval_ms.max(50));
        let deadline = Instant::now() + Duration::from_secs(self.limits.overall_timeout_secs.max(1));

        let mut cmd = process_utils::tokio_command(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| {
            OperationError::Fatal(format!("failed to spawn {}: {e}", command.program))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OperationError::Fatal("failed to capture child stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OperationError::Fatal("failed to capture child stderr".into()))?;

        let diagnostics = Arc::new(Mutex::new(DiagnosticRing::new(DIAGNOSTIC_CAPACITY)));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let mut guard = ScopedChild::new(child, grace);

        // The processor reports progress on stderr, the extractor mostly on
        // stdout; both streams feed the same activity clock and diagnostics.
        let stderr_task = {
            let diagnostics = Arc::clone(&diagnostics);
            let last_activity = Arc::clone(&last_activity);
            let observer = observer.clone();
            tokio::spawn(async move {
                let mut reader = RecordReader::new(stderr);
                while let Ok(Some(record)) = reader.next_record().await {
                    *last_activity.lock() = Instant::now();
                    match progress::decode(&record) {
                        Some(event) => {
                            if let Some(tx) = &observer {
                                let _ = tx.try_send(event);
                            }
                        }
                        None => diagnostics.lock().push(record),
                    }
                }
            })
        };

        let mut reader = RecordReader::new(stdout);
        let outcome: Result<()> = loop {
            let wake_at = {
                let last = *last_activity.lock();
                (last + stall).min(deadline).min(Instant::now() + check)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(OperationError::Fatal("operation cancelled".into()));
                }
                record = reader.next_record() => match record {
                    Ok(Some(line)) => {
                        *last_activity.lock() = Instant::now();
                        match progress::decode(&line) {
                            Some(event) => {
                                if let Some(tx) = &observer {
                                    let _ = tx.try_send(event);
                                }
                            }
                            None => diagnostics.lock().push(line),
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => {
                        diagnostics.lock().push(format!("output read failure: {e}"));
                        break Ok(());
                    }
                },
                _ = sleep_until(wake_at) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(OperationError::Network(format!(
                            "attempt exceeded overall timeout of {}s",
                            self.limits.overall_timeout_secs
                        )));
                    }
                    let idle = now.duration_since(*last_activity.lock());
                    if idle >= stall {
                        break Err(OperationError::Stalled { idle });
                    }
                    // Woken by the check interval while the child is healthy.
                }
            }
        };

        match outcome {
            Ok(()) => {
                let status = guard.reap().await;
                let _ = stderr_task.await;
                let status = status.map_err(|e| {
                    OperationError::Fatal(format!("failed to reap child: {e}"))
                })?;

                if status.success() {
                    Ok(diagnostics.lock().to_lines())
                } else {
                    let text = diagnostics.lock().joined();
                    debug!(code = ?status.code(), "child exited with failure");
                    if text.trim().is_empty() {
                        Err(OperationError::Fatal(format!(
                            "child exited with {status} and produced no diagnostics"
                        )))
                    } else {
                        Err(self.classifier.classify(&text))
                    }
                }
            }
            Err(error) => {
                guard.shutdown().await;
                stderr_task.abort();
                let _ = stderr_task.await;
                Err(error)
            }
        }
    }
}

/// Scoped child handle: whoever holds it owns cleanup.
///
/// `kill_on_drop` backstops abandoned futures; the explicit paths below
/// ask the child to exit, wait out a grace period, then force-kill and reap
/// so no zombie survives the supervision call.
struct ScopedChild {
    child: Child,
    grace: Duration,
}

impl ScopedChild {
    fn new(child: Child, grace: Duration) -> Self {
        Self { child, grace }
    }

    /// Wait for a child whose output streams already closed. Children that
    /// linger past the grace period are killed and reaped.
    async fn reap(&mut self) -> std::io::Result<std::process::ExitStatus> {
        match timeout(self.grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("child kept running after closing its output, killing");
                let _ = self.child.start_kill();
                self.child.wait().await
            }
        }
    }

    /// Terminate a still-running child: kill request, bounded wait, forced
    /// kill, reap.
    async fn shutdown(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = self.child.start_kill();
        if timeout(self.grace, self.child.wait()).await.is_err() {
            let _ = self.child.kill().await;
        }
    }
}

/// Bounded ring of diagnostic lines.
struct DiagnosticRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticRing {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn to_lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::resilience::BackoffPolicy;
    use std::time::Instant as StdInstant;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 1.0,
                jitter_min: 1.0,
                jitter_max: 1.0,
            },
        }
    }

    fn limits(stall_secs: u64, overall_secs: u64) -> SupervisorLimits {
        SupervisorLimits {
            stall_timeout_secs: stall_secs,
            stall_check_interval_ms: 50,
            overall_timeout_secs: overall_secs,
            network_timeout_secs: 5,
            termination_grace_ms: 200,
        }
    }

    fn supervisor(retry: RetryPolicy, limits: SupervisorLimits) -> ProcessSupervisor {
        ProcessSupervisor::new(
            retry,
            limits,
            &FailurePatterns::default(),
            Arc::new(CircuitBreakerRegistry::new(10, Duration::from_secs(60))),
        )
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn successful_run_captures_output() {
        let s = supervisor(fast_retry(1), limits(5, 30));
        let report = s
            .run(&sh("echo hello; echo world"), "t", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::Success);
        assert_eq!(report.captured_output, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn silent_child_is_stalled_and_terminated() {
        let s = supervisor(fast_retry(1), limits(1, 30));
        let started = StdInstant::now();
        let err = s
            .run(&sh("sleep 30"), "t", None, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            OperationError::MaxRetriesExceeded { last, .. } => {
                assert!(matches!(*last, OperationError::Stalled { .. }));
            }
            other => panic!("expected stall, got {other:?}"),
        }
        // Well under the 30s sleep: the child was killed, not waited out.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn steady_output_defeats_stall_but_not_deadline() {
        let s = supervisor(fast_retry(1), limits(5, 1));
        let started = StdInstant::now();
        let err = s
            .run(
                &sh("while true; do echo tick; sleep 0.1; done"),
                "t",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            OperationError::MaxRetriesExceeded { last, .. } => {
                assert!(matches!(*last, OperationError::Network(_)));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn transient_failures_retry_up_to_budget() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempts");
        let script = format!(
            "echo x >> {}; echo 'ERROR: HTTP Error 429: Too Many Requests' >&2; exit 1",
            marker.display()
        );

        let s = supervisor(fast_retry(3), limits(5, 30));
        let err = s
            .run(&sh(&script), "t", None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OperationError::MaxRetriesExceeded { attempts: 3, .. }
        ));
        let runs = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(runs, 3);
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempts");
        let script = format!(
            "echo x >> {}; echo 'ERROR: Sign in to confirm you are not a bot' >&2; exit 1",
            marker.display()
        );

        let s = supervisor(fast_retry(3), limits(5, 30));
        let err = s
            .run(&sh(&script), "t", None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::Authentication(_)));
        let runs = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempts");
        let script = format!(
            "echo x >> {}; echo 'ERROR: Connection reset by peer' >&2; exit 1",
            marker.display()
        );

        let breakers = Arc::new(CircuitBreakerRegistry::new(2, Duration::from_secs(60)));
        let s = ProcessSupervisor::new(
            fast_retry(1),
            limits(5, 30),
            &FailurePatterns::default(),
            Arc::clone(&breakers),
        );

        for _ in 0..2 {
            let _ = s
                .run(&sh(&script), "flaky-host", None, &CancellationToken::new())
                .await
                .unwrap_err();
        }
        let runs_before = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(runs_before, 2);

        let err = s
            .run(&sh(&script), "flaky-host", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::CircuitOpen { .. }));

        // No additional spawn happened while the circuit was open.
        let runs_after = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(runs_after, runs_before);
    }

    #[tokio::test]
    async fn cancellation_terminates_child_promptly() {
        let s = supervisor(fast_retry(3), limits(30, 60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = StdInstant::now();
        let err = s.run(&sh("sleep 30"), "t", None, &cancel).await.unwrap_err();

        assert!(matches!(err, OperationError::Fatal(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn progress_events_reach_the_observer() {
        let (tx, mut rx) = mpsc::channel(16);
        let s = supervisor(fast_retry(1), limits(5, 30));
        let script = r#"echo '{"status": "downloading", "_percent": 50.0, "downloaded_bytes": 10, "total_bytes": 20}'; echo '[download] 100.0% of 1.00MiB at 2.00MiB/s ETA 00:00'"#;

        let report = s
            .run(&sh(script), "t", Some(tx), &CancellationToken::new())
            .await
            .unwrap();
        // Progress lines are consumed as events, not diagnostics.
        assert!(report.captured_output.is_empty());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.percent, Some(50.0));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.percent, Some(100.0));
    }

    #[tokio::test]
    async fn stderr_diagnostics_feed_classification() {
        let s = supervisor(fast_retry(1), limits(5, 30));
        let err = s
            .run(
                &sh("echo 'ERROR: Tunnel connection failed: 407' >&2; exit 2"),
                "t",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            OperationError::MaxRetriesExceeded { last, .. } => {
                assert!(matches!(*last, OperationError::Proxy(_)));
            }
            other => panic!("expected proxy failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let s = supervisor(fast_retry(3), limits(5, 30));
        let spec = CommandSpec::new("definitely-not-installed-7c1d", vec![]);
        let err = s
            .run(&spec, "t", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Fatal(_)));
    }
}
