//! Download planning: decide which streams to fetch and how.

mod scorer;

pub use scorer::FormatScorer;

use tracing::{debug, info, warn};

use crate::catalog::{ClassifiedStream, StreamCatalog, StreamDescriptor, StreamKind};
use crate::config::FormatPreferences;
use crate::error::{OperationError, Result};

/// How the chosen streams will be retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// One stream fetched as-is.
    Direct,
    /// Separate video and audio fetches merged afterwards.
    Merge,
    /// Last-resort single stream; the extractor may substitute if the id
    /// disappears between listing and download.
    Fallback,
}

/// The chosen retrieval strategy for one fetch request. Immutable once
/// planned; consumed by the command layer.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub strategy: DownloadStrategy,
    pub primary: StreamDescriptor,
    /// Audio counterpart, present only for [`DownloadStrategy::Merge`].
    pub secondary: Option<StreamDescriptor>,
    /// Human-readable reason this plan was chosen.
    pub rationale: String,
}

impl DownloadPlan {
    fn direct(stream: &ClassifiedStream, rationale: impl Into<String>) -> Self {
        Self {
            strategy: DownloadStrategy::Direct,
            primary: stream.descriptor.clone(),
            secondary: None,
            rationale: rationale.into(),
        }
    }

    fn merge(
        video: &ClassifiedStream,
        audio: &ClassifiedStream,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            strategy: DownloadStrategy::Merge,
            primary: video.descriptor.clone(),
            secondary: Some(audio.descriptor.clone()),
            rationale: rationale.into(),
        }
    }

    /// Format selector understood by the extractor.
    pub fn format_selector(&self) -> String {
        match self.strategy {
            DownloadStrategy::Direct => self.primary.format_id.clone(),
            DownloadStrategy::Merge => {
                let audio = self
                    .secondary
                    .as_ref()
                    .map(|s| s.format_id.as_str())
                    .unwrap_or("bestaudio");
                format!("{}+{}", self.primary.format_id, audio)
            }
            DownloadStrategy::Fallback => format!("{}/best", self.primary.format_id),
        }
    }
}

/// Chooses a [`DownloadPlan`] from a classified catalog.
pub struct DownloadPlanner<'a> {
    prefs: &'a FormatPreferences,
}

impl<'a> DownloadPlanner<'a> {
    pub fn new(prefs: &'a FormatPreferences) -> Self {
        Self { prefs }
    }

    /// Plan the retrieval of one request.
    ///
    /// `target_id` may name a single stream or a `video+audio` pair; ids that
    /// do not resolve fall back to automatic planning rather than failing the
    /// request. Fails only when the catalog holds nothing usable.
    pub fn plan(&self, catalog: &StreamCatalog, target_id: Option<&str>) -> Result<DownloadPlan> {
        if catalog.is_empty() {
            return Err(OperationError::NoUsableFormats);
        }

        if let Some(target) = target_id.map(str::trim).filter(|t| !t.is_empty()) {
            if let Some((video_id, audio_id)) = target.split_once('+') {
                if let Some(plan) = self.plan_explicit_pair(catalog, video_id, audio_id) {
                    return Ok(plan);
                }
                warn!(
                    target,
                    "requested merge pair not fully present, planning automatically"
                );
            } else if let Some(plan) = self.plan_for_target(catalog, target) {
                return Ok(plan);
            } else {
                warn!(target, "requested format not found, planning automatically");
            }
        }

        self.plan_automatic(catalog)
    }

    fn plan_explicit_pair(
        &self,
        catalog: &StreamCatalog,
        video_id: &str,
        audio_id: &str,
    ) -> Option<DownloadPlan> {
        let video = catalog.find(video_id.trim())?;
        let audio = catalog.find(audio_id.trim())?;
        Some(DownloadPlan::merge(
            video,
            audio,
            format!(
                "explicit merge of {} and {}",
                video.descriptor.format_id, audio.descriptor.format_id
            ),
        ))
    }

    fn plan_for_target(&self, catalog: &StreamCatalog, target: &str) -> Option<DownloadPlan> {
        let stream = catalog.find(target)?;
        let plan = match stream.kind {
            StreamKind::Complete => DownloadPlan::direct(
                stream,
                format!("requested complete stream {}", stream.descriptor.format_id),
            ),
            StreamKind::AudioOnly => DownloadPlan::direct(
                stream,
                format!("requested audio stream {}", stream.descriptor.format_id),
            ),
            StreamKind::VideoOnly => match self.best_of_kind(catalog, StreamKind::AudioOnly) {
                Some(audio) => DownloadPlan::merge(
                    stream,
                    audio,
                    format!(
                        "requested video stream {} paired with best audio {}",
                        stream.descriptor.format_id, audio.descriptor.format_id
                    ),
                ),
                None => DownloadPlan::direct(
                    stream,
                    format!(
                        "requested video stream {} with no audio candidates",
                        stream.descriptor.format_id
                    ),
                ),
            },
        };
        Some(plan)
    }

    fn plan_automatic(&self, catalog: &StreamCatalog) -> Result<DownloadPlan> {
        if let Some(complete) = self.best_of_kind(catalog, StreamKind::Complete) {
            let plan = DownloadPlan::direct(
                complete,
                format!("best complete stream {}", complete.descriptor.format_id),
            );
            info!(rationale = %plan.rationale, "planned direct download");
            return Ok(plan);
        }

        let video = self.best_of_kind(catalog, StreamKind::VideoOnly);
        let audio = self.best_of_kind(catalog, StreamKind::AudioOnly);
        if let (Some(video), Some(audio)) = (video, audio) {
            let plan = DownloadPlan::merge(
                video,
                audio,
                format!(
                    "merge of best video {} and best audio {}",
                    video.descriptor.format_id, audio.descriptor.format_id
                ),
            );
            info!(rationale = %plan.rationale, "planned merge download");
            return Ok(plan);
        }

        let scorer = FormatScorer::new(self.prefs);
        let best = catalog
            .streams()
            .iter()
            .max_by(|a, b| compare_scored(&scorer, a, b))
            .ok_or(OperationError::NoUsableFormats)?;

        debug!(format_id = %best.descriptor.format_id, "no pairable streams, using fallback");
        Ok(DownloadPlan {
            strategy: DownloadStrategy::Fallback,
            primary: best.descriptor.clone(),
            secondary: None,
            rationale: format!(
                "fallback to best remaining stream {}",
                best.descriptor.format_id
            ),
        })
    }

    fn best_of_kind<'c>(
        &self,
        catalog: &'c StreamCatalog,
        kind: StreamKind,
    ) -> Option<&'c ClassifiedStream> {
        let scorer = FormatScorer::new(self.prefs);
        catalog
            .of_kind(kind)
            .max_by(|a, b| compare_scored(&scorer, a, b))
    }
}

/// Score comparison with a deterministic id tie-break so planning never
/// depends on listing order.
fn compare_scored(
    scorer: &FormatScorer<'_>,
    a: &ClassifiedStream,
    b: &ClassifiedStream,
) -> std::cmp::Ordering {
    scorer
        .score(a)
        .partial_cmp(&scorer.score(b))
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.descriptor.format_id.cmp(&b.descriptor.format_id))
}
