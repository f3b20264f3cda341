//! Pure scoring functions over classified streams.
//!
//! Scores are only meaningful for max-selection within one catalog; they are
//! never persisted or compared across listings.

use crate::catalog::{ClassifiedStream, StreamDescriptor, StreamKind};
use crate::config::FormatPreferences;

/// Weight separating audio tag-priority tiers from everything bitrate can
/// contribute, so an explicit marker always dominates raw bitrate.
const AUDIO_TIER_WEIGHT: f64 = 100_000.0;

/// Bonus applied when an audio candidate uses a preferred container or codec;
/// small enough to only ever break exact-bitrate ties.
const AUDIO_CONTAINER_TIEBREAK: f64 = 0.25;

pub struct FormatScorer<'a> {
    prefs: &'a FormatPreferences,
}

impl<'a> FormatScorer<'a> {
    pub fn new(prefs: &'a FormatPreferences) -> Self {
        Self { prefs }
    }

    /// Score a stream according to its kind.
    pub fn score(&self, stream: &ClassifiedStream) -> f64 {
        match stream.kind {
            StreamKind::Complete => self.complete_score(stream),
            StreamKind::VideoOnly => self.video_only_score(&stream.descriptor),
            StreamKind::AudioOnly => self.audio_only_score(&stream.descriptor),
        }
    }

    /// Complete streams: resolution up to 80 points (1920×1080 saturates),
    /// bitrate up to 20, container and codec bonuses, plus a flat +20 for
    /// already carrying both tracks.
    pub fn complete_score(&self, stream: &ClassifiedStream) -> f64 {
        let d = &stream.descriptor;
        let resolution = (d.pixel_area() as f64 / REFERENCE_AREA).min(1.0) * 80.0;
        let bitrate = (total_bitrate(d) / 5000.0 * 20.0).min(20.0);

        let ext = d.ext.to_lowercase();
        let container = if contains(&self.prefs.preferred_containers, &ext) {
            10.0
        } else if contains(&self.prefs.acceptable_containers, &ext) {
            5.0
        } else {
            0.0
        };

        let mut codecs = 0.0;
        if codec_in_family(&d.vcodec, &self.prefs.preferred_video_codecs) {
            codecs += 5.0;
        }
        if codec_in_family(&d.acodec, &self.prefs.preferred_audio_codecs) {
            codecs += 5.0;
        }

        let completeness = if stream.kind == StreamKind::Complete {
            20.0
        } else {
            0.0
        };

        resolution + bitrate + container + codecs + completeness
    }

    /// Video-only streams: area-weighted resolution, then bitrate (total
    /// bitrate discounted when the video bitrate is missing), then codec
    /// family.
    pub fn video_only_score(&self, d: &StreamDescriptor) -> f64 {
        let resolution = d.pixel_area() as f64 / REFERENCE_AREA * 2000.0;
        let bitrate = d
            .vbr
            .or_else(|| d.tbr.map(|t| t / 1.5))
            .unwrap_or(0.0);
        let codec = if codec_in_family(&d.vcodec, &self.prefs.preferred_video_codecs) {
            50.0
        } else {
            0.0
        };
        resolution + bitrate + codec
    }

    /// Audio-only streams: tag-priority tiers dominate, bitrate decides
    /// within a tier, preferred container/codec breaks exact ties.
    ///
    /// A 48 kbps track marked "original (default)" must outrank an unmarked
    /// 128 kbps track; sites use these markers to identify the real source
    /// audio among dubs and renditions.
    pub fn audio_only_score(&self, d: &StreamDescriptor) -> f64 {
        let bitrate = d.abr.or_else(|| d.tbr.map(|t| t / 2.0)).unwrap_or(0.0);
        let tier = self.audio_tag_tier(d) as f64 * AUDIO_TIER_WEIGHT;

        let mut tiebreak = 0.0;
        let ext = d.ext.to_lowercase();
        if contains(&self.prefs.preferred_audio_containers, &ext)
            || codec_in_family(&d.acodec, &self.prefs.preferred_audio_codecs)
        {
            tiebreak = AUDIO_CONTAINER_TIEBREAK;
        }

        tier + bitrate + tiebreak
    }

    /// Tag-priority tier for an audio candidate, strictly decreasing:
    /// original+default, default, original, preferred language, "primary",
    /// "high", unmarked, "low" (penalized below unmarked).
    fn audio_tag_tier(&self, d: &StreamDescriptor) -> u32 {
        let text = d.tag_text();
        let original = text.contains("original");
        let default = text.contains("default");

        if original && default {
            return 7;
        }
        if default {
            return 6;
        }
        if original {
            return 5;
        }
        if self.matches_preferred_language(d) {
            return 4;
        }
        if text.contains("primary") {
            return 3;
        }
        if text.contains("high") {
            return 2;
        }
        if text.contains("low") {
            return 0;
        }
        1
    }

    fn matches_preferred_language(&self, d: &StreamDescriptor) -> bool {
        let Some(preferred) = self.prefs.preferred_language.as_deref() else {
            return false;
        };
        let Some(language) = d.language.as_deref() else {
            return false;
        };
        let language = language.to_lowercase();
        let preferred = preferred.to_lowercase();
        language == preferred || language.starts_with(&format!("{preferred}-"))
    }
}

const REFERENCE_AREA: f64 = 1920.0 * 1080.0;

fn total_bitrate(d: &StreamDescriptor) -> f64 {
    d.tbr
        .or_else(|| match (d.vbr, d.abr) {
            (Some(v), Some(a)) => Some(v + a),
            (v, a) => v.or(a),
        })
        .unwrap_or(0.0)
}

fn contains(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(value))
}

fn codec_in_family(codec: &Option<String>, families: &[String]) -> bool {
    let Some(codec) = codec.as_deref() else {
        return false;
    };
    let codec = codec.to_lowercase();
    families
        .iter()
        .any(|family| codec.starts_with(&family.to_lowercase()))
}
