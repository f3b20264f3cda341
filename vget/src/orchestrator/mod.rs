//! Top-level orchestration of fetch requests.
//!
//! One fetch request flows strictly through probe → classify → plan →
//! execute → finalize. Circuit-breaker state is shared across requests per
//! target host; everything else is scoped to the request and torn down with
//! it, including any child processes still running when a request is
//! cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{AuthRecoveryCoordinator, CredentialRefresher};
use crate::catalog::{StreamCatalog, parse_listing};
use crate::command::CommandBuilder;
use crate::config::OrchestratorConfig;
use crate::error::{OperationError, Result};
use crate::planner::{DownloadPlan, DownloadPlanner, DownloadStrategy};
use crate::resilience::CircuitBreakerRegistry;
use crate::supervisor::{ExecutionAttempt, ProcessSupervisor, ProgressEvent};
use crate::utils::filename::sanitize_stem;
use crate::utils::fs as fsutil;

/// One media fetch request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Explicit stream id or `video+audio` pair; `None` plans automatically.
    pub target_format: Option<String>,
    pub output_dir: PathBuf,
    /// Cookie file to use from the start, before any credential refresh.
    pub cookies: Option<PathBuf>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            target_format: None,
            output_dir: output_dir.into(),
            cookies: None,
        }
    }

    pub fn with_target_format(mut self, target: impl Into<String>) -> Self {
        self.target_format = Some(target.into());
        self
    }

    pub fn with_cookies(mut self, cookies: impl Into<PathBuf>) -> Self {
        self.cookies = Some(cookies.into());
        self
    }
}

/// Outcome of a successful fetch.
#[derive(Debug)]
pub struct FetchReport {
    pub request_id: String,
    pub plan: DownloadPlan,
    /// Final artifact on disk.
    pub artifact: PathBuf,
    /// Every child-process attempt made across probe, download, and merge.
    pub attempts: Vec<ExecutionAttempt>,
}

/// Snapshot of one in-flight request.
#[derive(Debug, Clone)]
pub struct ActiveRequestInfo {
    pub request_id: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
}

struct ActiveRequest {
    url: String,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Façade composing planning, supervision, and auth recovery.
pub struct DownloadOrchestrator {
    config: Arc<OrchestratorConfig>,
    supervisor: ProcessSupervisor,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    /// Single permit: only one request relays progress to the shared display.
    progress_slot: Arc<Semaphore>,
    active: DashMap<String, ActiveRequest>,
}

impl DownloadOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.failure_threshold,
            Duration::from_secs(config.circuit_breaker.cooldown_secs),
        ));
        let supervisor = ProcessSupervisor::new(
            config.retry.clone(),
            config.supervisor.clone(),
            &config.patterns,
            breakers,
        );
        Self {
            config: Arc::new(config),
            supervisor,
            refresher: None,
            progress_slot: Arc::new(Semaphore::new(1)),
            active: DashMap::new(),
        }
    }

    /// Attach the credential-refresh collaborator enabling auth recovery.
    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// First version line of the extractor binary, if it responds.
    pub fn extractor_version(&self) -> Option<String> {
        process_utils::probe_version(&self.config.extractor.binary_path)
    }

    /// First version line of the processor binary, if it responds.
    pub fn processor_version(&self) -> Option<String> {
        process_utils::probe_version(&self.config.processor.binary_path)
    }

    /// Whether the extractor binary answers a version probe.
    pub fn extractor_available(&self) -> bool {
        self.extractor_version().is_some()
    }

    /// Whether the processor binary answers a version probe.
    pub fn processor_available(&self) -> bool {
        self.processor_version().is_some()
    }

    /// Fulfill one fetch request.
    ///
    /// Progress events stream to `observer` while this request holds the
    /// shared display slot; without the slot the download proceeds silently.
    pub async fn fetch(
        &self,
        request: FetchRequest,
        observer: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<FetchReport> {
        let request_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.active.insert(
            request_id.clone(),
            ActiveRequest {
                url: request.url.clone(),
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );

        let result = self
            .fetch_inner(&request_id, &request, observer, &cancel)
            .await;
        self.active.remove(&request_id);
        result
    }

    /// Cancel one in-flight request. Returns whether it was found.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.active.get(request_id) {
            Some(entry) => {
                info!(request_id, url = %entry.url, "cancelling fetch request");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight request (shutdown path).
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.cancel.cancel();
        }
    }

    pub fn active_requests(&self) -> Vec<ActiveRequestInfo> {
        self.active
            .iter()
            .map(|entry| ActiveRequestInfo {
                request_id: entry.key().clone(),
                url: entry.url.clone(),
                started_at: entry.started_at,
            })
            .collect()
    }

    async fn fetch_inner(
        &self,
        request_id: &str,
        request: &FetchRequest,
        observer: Option<mpsc::Sender<ProgressEvent>>,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let target = target_key(&request.url);
        let builder = CommandBuilder::new(
            &self.config.extractor,
            &self.config.processor,
            &self.config.supervisor,
        );
        fsutil::ensure_dir(&request.output_dir).await?;

        let probe = builder.probe(&request.url, request.cookies.as_deref());
        let probe_report = self.supervisor.run(&probe, &target, None, cancel).await?;
        let listing = parse_listing(&probe_report.output_text())?;

        let title = listing
            .title
            .clone()
            .or_else(|| listing.id.clone())
            .unwrap_or_else(|| "download".to_string());
        let stem = sanitize_stem(&title);
        let catalog = StreamCatalog::classify(listing.formats);
        info!(request_id, streams = catalog.len(), title = %title, "classified stream listing");

        let planner = DownloadPlanner::new(&self.config.preferences);
        let plan = planner.plan(&catalog, request.target_format.as_deref())?;
        info!(request_id, strategy = ?plan.strategy, rationale = %plan.rationale, "download plan chosen");

        let mut attempts = probe_report.attempts;

        // The relay task owns the display permit (when it wins one) and
        // releases it once every sender is gone, on success and failure alike.
        let progress_tx = start_progress_relay(observer, Arc::clone(&self.progress_slot));

        let executed = match &self.refresher {
            Some(refresher) => {
                let coordinator = AuthRecoveryCoordinator::new(Arc::clone(refresher));
                coordinator
                    .run(&target, request.cookies.clone(), |cookies| {
                        self.execute_plan(
                            &builder,
                            request,
                            &plan,
                            &stem,
                            &target,
                            cookies,
                            progress_tx.clone(),
                            cancel,
                        )
                    })
                    .await
            }
            None => {
                self.execute_plan(
                    &builder,
                    request,
                    &plan,
                    &stem,
                    &target,
                    request.cookies.clone(),
                    progress_tx.clone(),
                    cancel,
                )
                .await
            }
        };
        drop(progress_tx);

        match executed {
            Ok((artifact, mut execution_attempts)) => {
                attempts.append(&mut execution_attempts);
                info!(request_id, artifact = %artifact.display(), "fetch completed");
                Ok(FetchReport {
                    request_id: request_id.to_string(),
                    plan,
                    artifact,
                    attempts,
                })
            }
            Err(error) => {
                let removed =
                    fsutil::cleanup_partial_artifacts(&request.output_dir, &stem).await;
                if removed > 0 {
                    debug!(request_id, removed, "cleaned partial artifacts after failure");
                }
                Err(error)
            }
        }
    }

    async fn execute_plan(
        &self,
        builder: &CommandBuilder<'_>,
        request: &FetchRequest,
        plan: &DownloadPlan,
        stem: &str,
        target: &str,
        cookies: Option<PathBuf>,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, Vec<ExecutionAttempt>)> {
        let out_dir = &request.output_dir;
        let mut attempts = Vec::new();

        match plan.strategy {
            DownloadStrategy::Direct | DownloadStrategy::Fallback => {
                let template = out_dir.join(format!("{stem}.%(ext)s"));
                let command = builder.download(
                    &request.url,
                    &plan.format_selector(),
                    &template,
                    cookies.as_deref(),
                );
                let report = self
                    .supervisor
                    .run(&command, target, Some(progress), cancel)
                    .await?;
                attempts.extend(report.attempts);

                let artifact = fsutil::find_artifact(out_dir, stem).await.ok_or_else(|| {
                    OperationError::Fatal(format!(
                        "download finished but no artifact matching '{stem}' was produced"
                    ))
                })?;
                Ok((artifact, attempts))
            }
            DownloadStrategy::Merge => {
                let audio_descriptor = plan.secondary.as_ref().ok_or_else(|| {
                    OperationError::Fatal("merge plan without an audio stream".into())
                })?;

                let video_stem = format!("{stem}.video");
                let audio_stem = format!("{stem}.audio");

                for (part_stem, format_id) in [
                    (&video_stem, &plan.primary.format_id),
                    (&audio_stem, &audio_descriptor.format_id),
                ] {
                    let template = out_dir.join(format!("{part_stem}.%(ext)s"));
                    let command = builder.download(
                        &request.url,
                        format_id,
                        &template,
                        cookies.as_deref(),
                    );
                    let report = self
                        .supervisor
                        .run(&command, target, Some(progress.clone()), cancel)
                        .await?;
                    attempts.extend(report.attempts);
                }

                let video_path =
                    fsutil::find_artifact(out_dir, &video_stem)
                        .await
                        .ok_or_else(|| {
                            OperationError::Fatal("video track missing after download".into())
                        })?;
                let audio_path =
                    fsutil::find_artifact(out_dir, &audio_stem)
                        .await
                        .ok_or_else(|| {
                            OperationError::Fatal("audio track missing after download".into())
                        })?;

                let container = if plan.primary.ext.is_empty() {
                    "mp4"
                } else {
                    plan.primary.ext.as_str()
                };
                let output = out_dir.join(format!("{stem}.{container}"));
                let merge = builder.merge(&video_path, &audio_path, &output);
                let report = self
                    .supervisor
                    .run(&merge, target, Some(progress), cancel)
                    .await?;
                attempts.extend(report.attempts);

                for intermediate in [&video_path, &audio_path] {
                    if let Err(err) = tokio::fs::remove_file(intermediate).await {
                        warn!(path = %intermediate.display(), error = %err, "failed to remove intermediate track");
                    }
                }
                Ok((output, attempts))
            }
        }
    }
}

/// Per-target circuit-breaker key: the remote host, or the raw URL when it
/// does not parse.
fn target_key(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Spawn the relay that forwards progress to the shared observer.
///
/// Only one request at a time may drive the visual indicator, so the relay
/// tries to take the display slot; without it, events are drained silently
/// while the download proceeds. The permit is released when the relay ends,
/// i.e. once every sender handle is dropped.
fn start_progress_relay(
    observer: Option<mpsc::Sender<ProgressEvent>>,
    slot: Arc<Semaphore>,
) -> mpsc::Sender<ProgressEvent> {
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
    tokio::spawn(async move {
        let permit = match &observer {
            Some(_) => {
                let permit = slot.try_acquire_owned().ok();
                if permit.is_none() {
                    debug!("progress display busy, downloading silently");
                }
                permit
            }
            None => None,
        };
        while let Some(event) = rx.recv().await {
            if permit.is_some()
                && let Some(observer) = &observer
            {
                let _ = observer.try_send(event);
            }
        }
    });
    tx
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::resilience::{BackoffPolicy, RetryPolicy};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_config(extractor: &Path, processor: &Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.extractor.binary_path = extractor.to_string_lossy().to_string();
        config.processor.binary_path = processor.to_string_lossy().to_string();
        config.retry = RetryPolicy {
            max_attempts: 2,
            backoff: BackoffPolicy {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 1.0,
                jitter_min: 1.0,
                jitter_max: 1.0,
            },
        };
        config.supervisor.stall_timeout_secs = 5;
        config.supervisor.overall_timeout_secs = 30;
        config.supervisor.termination_grace_ms = 200;
        config
    }

    /// Stub processor: concatenates its `-i` inputs into the last argument.
    fn stub_processor(dir: &Path) -> PathBuf {
        write_script(
            dir,
            "processor",
            r#"
out=""
for a in "$@"; do out="$a"; done
prev=""
inputs=""
for a in "$@"; do
  [ "$prev" = "-i" ] && inputs="$inputs \"$a\""
  prev="$a"
done
eval "cat $inputs" > "$out"
echo "frame=1 size=1kB time=00:00:01.00 bitrate=8.0kbits/s speed=1x" >&2
exit 0
"#,
        )
    }

    const ARG_SCAN: &str = r#"
dump=0
out=""
fmt=""
cookies=""
prev=""
for a in "$@"; do
  [ "$prev" = "-o" ] && out="$a"
  [ "$prev" = "-f" ] && fmt="$a"
  [ "$prev" = "--cookies" ] && cookies="$a"
  [ "$a" = "--dump-json" ] && dump=1
  prev="$a"
done
"#;

    #[tokio::test]
    async fn direct_fetch_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");

        let extractor = write_script(
            dir.path(),
            "extractor",
            &format!(
                r#"{ARG_SCAN}
if [ "$dump" = "1" ]; then
  echo '{{"id":"vid1","title":"Test Clip","formats":[{{"format_id":"22","ext":"mp4","vcodec":"avc1.64001F","acodec":"mp4a.40.2","width":1280,"height":720,"tbr":2000.0}},{{"format_id":"140","ext":"m4a","vcodec":"none","acodec":"mp4a.40.2","abr":128.0}}]}}'
  exit 0
fi
out=$(printf '%s' "$out" | sed 's/%(ext)s/mp4/')
echo '{{"status": "downloading", "_percent": 50.0, "downloaded_bytes": 5, "total_bytes": 10}}'
printf 'media-bytes' > "$out"
echo '{{"status": "finished", "_percent": 100.0}}'
exit 0
"#
            ),
        );
        let processor = stub_processor(dir.path());

        let orchestrator = DownloadOrchestrator::new(test_config(&extractor, &processor));
        let (tx, mut rx) = mpsc::channel(32);
        let report = orchestrator
            .fetch(
                FetchRequest::new("https://media.example.com/watch?v=1", &out_dir),
                Some(tx),
            )
            .await
            .unwrap();

        assert_eq!(report.plan.strategy, DownloadStrategy::Direct);
        assert_eq!(report.plan.primary.format_id, "22");
        assert_eq!(report.artifact, out_dir.join("Test Clip.mp4"));
        assert_eq!(
            std::fs::read_to_string(&report.artifact).unwrap(),
            "media-bytes"
        );
        assert!(!report.attempts.is_empty());

        let mut percents = Vec::new();
        while let Some(event) = rx.recv().await {
            percents.push(event.percent);
        }
        assert!(percents.contains(&Some(50.0)));
        assert!(percents.contains(&Some(100.0)));

        // The request is no longer tracked once finished.
        assert!(orchestrator.active_requests().is_empty());
    }

    #[tokio::test]
    async fn merge_fetch_combines_split_streams() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");

        let extractor = write_script(
            dir.path(),
            "extractor",
            &format!(
                r#"{ARG_SCAN}
if [ "$dump" = "1" ]; then
  echo '{{"id":"vid2","title":"Split","formats":[{{"format_id":"137","ext":"mp4","vcodec":"avc1.640028","acodec":"none","width":1920,"height":1080,"vbr":2500.0}},{{"format_id":"140","ext":"m4a","vcodec":"none","acodec":"mp4a.40.2","abr":128.0}}]}}'
  exit 0
fi
if [ "$fmt" = "137" ]; then ext=mp4; data=video-data; else ext=m4a; data=audio-data; fi
out=$(printf '%s' "$out" | sed "s/%(ext)s/$ext/")
printf '%s' "$data" > "$out"
exit 0
"#
            ),
        );
        let processor = stub_processor(dir.path());

        let orchestrator = DownloadOrchestrator::new(test_config(&extractor, &processor));
        let report = orchestrator
            .fetch(FetchRequest::new("https://media.example.com/v/2", &out_dir), None)
            .await
            .unwrap();

        assert_eq!(report.plan.strategy, DownloadStrategy::Merge);
        assert_eq!(report.artifact, out_dir.join("Split.mp4"));
        assert_eq!(
            std::fs::read_to_string(&report.artifact).unwrap(),
            "video-dataaudio-data"
        );

        // Intermediate tracks are removed after a successful merge.
        assert!(!out_dir.join("Split.video.mp4").exists());
        assert!(!out_dir.join("Split.audio.m4a").exists());
    }

    #[tokio::test]
    async fn terminal_failure_cleans_partial_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");

        let extractor = write_script(
            dir.path(),
            "extractor",
            &format!(
                r#"{ARG_SCAN}
if [ "$dump" = "1" ]; then
  echo '{{"id":"vid3","title":"Broken","formats":[{{"format_id":"22","ext":"mp4","vcodec":"avc1","acodec":"mp4a","width":1280,"height":720}}]}}'
  exit 0
fi
stem=$(printf '%s' "$out" | sed 's/\.%(ext)s$//')
printf 'partial' > "$stem.mp4.part"
echo 'ERROR: Video unavailable. This content has been removed' >&2
exit 1
"#
            ),
        );
        let processor = stub_processor(dir.path());

        let orchestrator = DownloadOrchestrator::new(test_config(&extractor, &processor));
        let err = orchestrator
            .fetch(FetchRequest::new("https://media.example.com/v/3", &out_dir), None)
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::Fatal(_)));
        assert!(!out_dir.join("Broken.mp4.part").exists());
    }

    #[tokio::test]
    async fn empty_listing_fails_planning() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = write_script(
            dir.path(),
            "extractor",
            &format!(
                r#"{ARG_SCAN}
echo '{{"id":"vid4","title":"Empty","formats":[]}}'
exit 0
"#
            ),
        );
        let processor = stub_processor(dir.path());

        let orchestrator = DownloadOrchestrator::new(test_config(&extractor, &processor));
        let err = orchestrator
            .fetch(
                FetchRequest::new("https://media.example.com/v/4", dir.path().join("out")),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::NoUsableFormats));
    }

    struct WritingRefresher {
        cookie_path: PathBuf,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialRefresher for WritingRefresher {
        async fn refresh(&self, _domain: &str) -> crate::error::Result<Option<PathBuf>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&self.cookie_path, "# Netscape HTTP Cookie File\n").unwrap();
            Ok(Some(self.cookie_path.clone()))
        }
    }

    #[tokio::test]
    async fn auth_failure_recovers_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");

        // Downloads demand a cookie file; the probe works anonymously.
        let extractor = write_script(
            dir.path(),
            "extractor",
            &format!(
                r#"{ARG_SCAN}
if [ "$dump" = "1" ]; then
  echo '{{"id":"vid5","title":"Gated","formats":[{{"format_id":"22","ext":"mp4","vcodec":"avc1","acodec":"mp4a","width":1280,"height":720}}]}}'
  exit 0
fi
if [ -z "$cookies" ] || [ ! -f "$cookies" ]; then
  echo 'ERROR: Sign in to confirm your identity' >&2
  exit 1
fi
out=$(printf '%s' "$out" | sed 's/%(ext)s/mp4/')
printf 'gated-bytes' > "$out"
exit 0
"#
            ),
        );
        let processor = stub_processor(dir.path());

        let refresher = Arc::new(WritingRefresher {
            cookie_path: dir.path().join("fresh-cookies.txt"),
            calls: AtomicU32::new(0),
        });
        let orchestrator = DownloadOrchestrator::new(test_config(&extractor, &processor))
            .with_credential_refresher(Arc::clone(&refresher) as _);

        let report = orchestrator
            .fetch(FetchRequest::new("https://media.example.com/v/5", &out_dir), None)
            .await
            .unwrap();

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read_to_string(&report.artifact).unwrap(),
            "gated-bytes"
        );
    }

    #[tokio::test]
    async fn persistent_auth_failure_surfaces_after_one_replay() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("download-attempts");

        let extractor = write_script(
            dir.path(),
            "extractor",
            &format!(
                r#"{ARG_SCAN}
if [ "$dump" = "1" ]; then
  echo '{{"id":"vid6","title":"Blocked","formats":[{{"format_id":"22","ext":"mp4","vcodec":"avc1","acodec":"mp4a","width":1280,"height":720}}]}}'
  exit 0
fi
echo x >> {marker}
echo 'ERROR: Sign in to confirm your identity' >&2
exit 1
"#,
                marker = marker.display()
            ),
        );
        let processor = stub_processor(dir.path());

        let refresher = Arc::new(WritingRefresher {
            cookie_path: dir.path().join("fresh-cookies.txt"),
            calls: AtomicU32::new(0),
        });
        let orchestrator = DownloadOrchestrator::new(test_config(&extractor, &processor))
            .with_credential_refresher(Arc::clone(&refresher) as _);

        let err = orchestrator
            .fetch(
                FetchRequest::new("https://media.example.com/v/6", dir.path().join("out")),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::Authentication(_)));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        // One original attempt plus exactly one replay.
        let runs = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(runs, 2);
    }

    #[tokio::test]
    async fn cancel_all_aborts_inflight_requests() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");

        // The download phase hangs silently; only cancellation ends it early.
        let extractor = write_script(
            dir.path(),
            "extractor",
            &format!(
                r#"{ARG_SCAN}
if [ "$dump" = "1" ]; then
  echo '{{"id":"vid7","title":"Slow","formats":[{{"format_id":"22","ext":"mp4","vcodec":"avc1","acodec":"mp4a","width":1280,"height":720}}]}}'
  exit 0
fi
sleep 30
"#
            ),
        );
        let processor = stub_processor(dir.path());
        let mut config = test_config(&extractor, &processor);
        config.supervisor.stall_timeout_secs = 25;
        let orchestrator = Arc::new(DownloadOrchestrator::new(config));

        let task = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            let out_dir = out_dir.clone();
            async move {
                orchestrator
                    .fetch(FetchRequest::new("https://media.example.com/v/7", out_dir), None)
                    .await
            }
        });

        for _ in 0..100 {
            if !orchestrator.active_requests().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!orchestrator.active_requests().is_empty());
        orchestrator.cancel_all();

        let result = task.await.unwrap();
        assert!(result.is_err());
        assert!(orchestrator.active_requests().is_empty());
    }

    #[test]
    fn target_key_extracts_host() {
        assert_eq!(
            target_key("https://media.example.com/watch?v=1"),
            "media.example.com"
        );
        assert_eq!(target_key("not a url"), "not a url");
    }
}
