//! Stream catalog: decoding and classification of extractor listings.
//!
//! The extractor's `--dump-json` output lists every retrievable rendition of
//! a page. Listings are wildly inconsistent across hosts: codecs may be
//! missing, mislabeled, or literally `"unknown"`, and some hosts tag merged
//! streams with nothing but pixel dimensions. Classification turns that mess
//! into one of three kinds the planner can reason about.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OperationError, Result};

/// One available remote stream, as listed by the extractor.
///
/// Field names follow the extractor's JSON vocabulary. A codec value of
/// `"none"` means the track is absent; `None` means the host did not say.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDescriptor {
    pub format_id: String,
    pub ext: String,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Total bitrate in kbps.
    pub tbr: Option<f64>,
    /// Video bitrate in kbps.
    pub vbr: Option<f64>,
    /// Audio bitrate in kbps.
    pub abr: Option<f64>,
    pub filesize: Option<u64>,
    pub language: Option<String>,
    pub format_note: Option<String>,
    /// Full format label, e.g. `"251 - audio only (medium)"`.
    pub format: Option<String>,
}

impl StreamDescriptor {
    pub fn has_video(&self) -> bool {
        codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        codec_present(&self.acodec)
    }

    pub fn has_dimensions(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }

    /// Pixel area, zero when dimensions are unknown.
    pub fn pixel_area(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }

    /// Lower-cased concatenation of the free-text hint fields.
    pub fn tag_text(&self) -> String {
        let mut text = String::new();
        for part in [&self.format_note, &self.language, &self.format] {
            if let Some(value) = part {
                text.push_str(&value.to_lowercase());
                text.push(' ');
            }
        }
        text
    }

    fn marker_text(&self) -> String {
        let mut text = self.tag_text();
        for codec in [&self.vcodec, &self.acodec] {
            if let Some(value) = codec {
                text.push_str(&value.to_lowercase());
                text.push(' ');
            }
        }
        text
    }
}

fn codec_present(codec: &Option<String>) -> bool {
    matches!(codec.as_deref(), Some(value) if !value.is_empty() && value != "none")
}

fn codec_is(codec: &Option<String>, literal: &str) -> bool {
    codec.as_deref() == Some(literal)
}

/// Derived classification of a [`StreamDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Carries both audio and video; downloadable without merging.
    Complete,
    VideoOnly,
    AudioOnly,
}

/// A descriptor with its computed kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedStream {
    pub descriptor: StreamDescriptor,
    pub kind: StreamKind,
}

/// The `--dump-json` envelope around the formats array.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamListing {
    pub id: Option<String>,
    pub title: Option<String>,
    pub webpage_url: Option<String>,
    pub formats: Vec<StreamDescriptor>,
}

/// Decode a listing dump: one JSON object, or one object per line for lists.
///
/// For line-delimited playlist dumps the first decodable entry wins; this
/// crate fetches a single page per request.
pub fn parse_listing(raw: &str) -> Result<StreamListing> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(OperationError::Listing("empty listing output".into()));
    }

    match serde_json::from_str::<StreamListing>(trimmed) {
        Ok(listing) => Ok(listing),
        Err(first_err) => {
            for line in trimmed.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Ok(listing) = serde_json::from_str::<StreamListing>(line) {
                    return Ok(listing);
                }
            }
            Err(OperationError::Listing(first_err.to_string()))
        }
    }
}

/// Classified view over one listing.
#[derive(Debug, Clone, Default)]
pub struct StreamCatalog {
    streams: Vec<ClassifiedStream>,
}

impl StreamCatalog {
    /// Classify a raw descriptor list. Never fails; descriptors without an id
    /// are dropped since nothing downstream could reference them.
    pub fn classify(raw: Vec<StreamDescriptor>) -> Self {
        let mut streams = Vec::with_capacity(raw.len());
        for descriptor in raw {
            if descriptor.format_id.trim().is_empty() {
                warn!("dropping stream entry without a format id");
                continue;
            }
            let kind = classify_descriptor(&descriptor);
            streams.push(ClassifiedStream { descriptor, kind });
        }
        Self { streams }
    }

    pub fn streams(&self) -> &[ClassifiedStream] {
        &self.streams
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn find(&self, format_id: &str) -> Option<&ClassifiedStream> {
        self.streams
            .iter()
            .find(|s| s.descriptor.format_id == format_id)
    }

    pub fn of_kind(&self, kind: StreamKind) -> impl Iterator<Item = &ClassifiedStream> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }
}

/// Classification precedence, from strongest signal to weakest:
/// explicit textual markers, then the `"unknown"`-codecs-with-dimensions
/// case, then fully untagged streams with dimensions, then codec presence,
/// then an assume-playable fallback. The two dimension cases default to
/// `Complete` deliberately: forcing a merge on an already-muxed stream
/// produces a broken artifact, while downloading a complete stream that
/// turns out to be video-only merely loses audio.
fn classify_descriptor(descriptor: &StreamDescriptor) -> StreamKind {
    let markers = descriptor.marker_text();
    if markers.contains("audio only") {
        return StreamKind::AudioOnly;
    }
    if markers.contains("video only") {
        return StreamKind::VideoOnly;
    }

    let unknown_pair =
        codec_is(&descriptor.vcodec, "unknown") && codec_is(&descriptor.acodec, "unknown");
    if unknown_pair && descriptor.has_dimensions() {
        return StreamKind::Complete;
    }

    if descriptor.vcodec.is_none() && descriptor.acodec.is_none() && descriptor.has_dimensions() {
        return StreamKind::Complete;
    }

    match (descriptor.has_video(), descriptor.has_audio()) {
        (true, true) => StreamKind::Complete,
        (true, false) => StreamKind::VideoOnly,
        (false, true) => StreamKind::AudioOnly,
        (false, false) => {
            debug!(
                format_id = %descriptor.format_id,
                "no codec signal and no dimensions, assuming complete stream"
            );
            StreamKind::Complete
        }
    }
}
