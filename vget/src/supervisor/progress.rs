//! Progress decoding for child-process output.
//!
//! The extractor reports progress two ways: JSON fragments (one object per
//! line when a progress template is active) and human-readable text lines.
//! Either may carry only a subset of the fields, so every field is optional.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

/// A decoded unit of child-process progress. Scoped to a single process
/// invocation and discarded when it ends.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressEvent {
    /// Completion percentage, 0–100.
    pub percent: Option<f64>,
    pub bytes_completed: Option<u64>,
    pub bytes_total: Option<u64>,
}

/// JSON fragment shape: `{"status": "downloading", "_percent": 12.5,
/// "downloaded_bytes": 1048576, "total_bytes": 8388608}`.
#[derive(Debug, Deserialize)]
struct JsonFragment {
    status: Option<String>,
    #[serde(rename = "_percent")]
    percent: Option<f64>,
    downloaded_bytes: Option<u64>,
    total_bytes: Option<u64>,
    total_bytes_estimate: Option<f64>,
}

/// Text shape: `[download]  42.1% of ~ 5.68MiB at  1.23MiB/s ETA 00:04`.
static TEXT_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,3}(?:\.\d+)?)%\s+of\s+~?\s*(\d+(?:\.\d+)?)\s*([KMGT]i?B)")
        .expect("progress pattern is valid")
});

static TEXT_PERCENT_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,3}(?:\.\d+)?)%").expect("percent pattern is valid")
});

/// Try to decode one output record as progress.
///
/// Returns `None` for anything that is not progress; the caller accumulates
/// such lines as diagnostic text instead.
pub fn decode(line: &str) -> Option<ProgressEvent> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        return decode_json(trimmed);
    }
    decode_text(trimmed)
}

fn decode_json(line: &str) -> Option<ProgressEvent> {
    let fragment: JsonFragment = serde_json::from_str(line).ok()?;
    // Only fragments that self-identify as progress count; the listing dump
    // is also a single JSON object and must not be swallowed here.
    match fragment.status.as_deref() {
        Some("downloading") => Some(ProgressEvent {
            percent: fragment.percent,
            bytes_completed: fragment.downloaded_bytes,
            bytes_total: fragment
                .total_bytes
                .or_else(|| fragment.total_bytes_estimate.map(|b| b as u64)),
        }),
        Some("finished") => Some(ProgressEvent {
            percent: Some(100.0),
            bytes_completed: fragment.downloaded_bytes.or(fragment.total_bytes),
            bytes_total: fragment.total_bytes,
        }),
        _ => None,
    }
}

fn decode_text(line: &str) -> Option<ProgressEvent> {
    if let Some(captures) = TEXT_PROGRESS.captures(line) {
        let percent: f64 = captures[1].parse().ok()?;
        let size: f64 = captures[2].parse().ok()?;
        let total = (size * unit_multiplier(&captures[3])) as u64;
        return Some(ProgressEvent {
            percent: Some(percent),
            bytes_completed: Some((total as f64 * percent / 100.0) as u64),
            bytes_total: Some(total),
        });
    }

    // Some hosts emit bare percentage updates without size information.
    if line.to_lowercase().contains("[download]")
        && let Some(captures) = TEXT_PERCENT_ONLY.captures(line)
    {
        let percent: f64 = captures[1].parse().ok()?;
        return Some(ProgressEvent {
            percent: Some(percent),
            ..Default::default()
        });
    }

    None
}

fn unit_multiplier(unit: &str) -> f64 {
    let base: f64 = if unit.len() == 3 { 1024.0 } else { 1000.0 };
    match unit.chars().next().map(|c| c.to_ascii_uppercase()) {
        Some('K') => base,
        Some('M') => base.powi(2),
        Some('G') => base.powi(3),
        Some('T') => base.powi(4),
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_json_downloading_fragment() {
        let event = decode(
            r#"{"status": "downloading", "_percent": 42.5, "downloaded_bytes": 1024, "total_bytes": 4096}"#,
        )
        .unwrap();
        assert_eq!(event.percent, Some(42.5));
        assert_eq!(event.bytes_completed, Some(1024));
        assert_eq!(event.bytes_total, Some(4096));
    }

    #[test]
    fn decodes_json_finished_fragment() {
        let event = decode(r#"{"status": "finished", "total_bytes": 4096}"#).unwrap();
        assert_eq!(event.percent, Some(100.0));
        assert_eq!(event.bytes_total, Some(4096));
    }

    #[test]
    fn json_estimate_fills_missing_total() {
        let event = decode(
            r#"{"status": "downloading", "downloaded_bytes": 10, "total_bytes_estimate": 99.7}"#,
        )
        .unwrap();
        assert_eq!(event.bytes_total, Some(99));
    }

    #[test]
    fn listing_dump_is_not_progress() {
        assert_eq!(decode(r#"{"id": "abc", "formats": []}"#), None);
        assert_eq!(decode(r#"{"status": "oops"}"#), None);
    }

    #[test]
    fn decodes_text_progress_line() {
        let event = decode("[download]  42.1% of ~ 5.68MiB at  1.23MiB/s ETA 00:04").unwrap();
        assert_eq!(event.percent, Some(42.1));
        let total = event.bytes_total.unwrap();
        assert_eq!(total, (5.68 * 1024.0 * 1024.0) as u64);
        assert_eq!(
            event.bytes_completed.unwrap(),
            (total as f64 * 0.421) as u64
        );
    }

    #[test]
    fn decodes_decimal_units() {
        let event = decode("[download] 10.0% of 100MB at 1MB/s ETA 00:30").unwrap();
        assert_eq!(event.bytes_total, Some(100_000_000));
    }

    #[test]
    fn decodes_bare_percent_download_line() {
        let event = decode("[download] 99.8%").unwrap();
        assert_eq!(event.percent, Some(99.8));
        assert_eq!(event.bytes_total, None);
    }

    #[test]
    fn plain_text_is_not_progress() {
        assert_eq!(decode("ERROR: HTTP Error 403: Forbidden"), None);
        assert_eq!(decode("[info] Writing video metadata"), None);
        assert_eq!(decode("100 lines processed"), None);
    }
}
