//! Typed configuration surface consumed by the orchestrator core.
//!
//! Loading and layering these values from files is owned by the embedding
//! application; the core only reads them. Every field has a serde default so
//! a partial document (or none at all) yields a working configuration.

use serde::{Deserialize, Serialize};

use crate::resilience::RetryPolicy;

/// Top-level configuration for one orchestrator instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub extractor: ExtractorConfig,
    pub processor: ProcessorConfig,
    pub retry: RetryPolicy,
    pub supervisor: SupervisorLimits,
    pub circuit_breaker: CircuitBreakerConfig,
    pub patterns: FailurePatterns,
    pub preferences: FormatPreferences,
}

/// Invocation settings for the extraction binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Path or name of the extractor binary.
    pub binary_path: String,
    /// Extra arguments prepended to every invocation.
    pub extra_args: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            binary_path: "yt-dlp".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Invocation settings for the merge/transcode binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Path or name of the processor binary.
    pub binary_path: String,
    /// Extra arguments inserted before the output path.
    pub extra_args: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Time limits the supervisor enforces on a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorLimits {
    /// Abort an attempt when no output arrives for this long.
    pub stall_timeout_secs: u64,
    /// Granularity of the stall watchdog.
    pub stall_check_interval_ms: u64,
    /// Hard ceiling on a single attempt.
    pub overall_timeout_secs: u64,
    /// Socket-level timeout forwarded to the extractor.
    pub network_timeout_secs: u64,
    /// Grace period between asking a child to exit and force-killing it.
    pub termination_grace_ms: u64,
}

impl Default for SupervisorLimits {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 60,
            stall_check_interval_ms: 500,
            overall_timeout_secs: 3600,
            network_timeout_secs: 30,
            termination_grace_ms: 2000,
        }
    }
}

/// Circuit breaker tuning, shared by all targets of one orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before permitting a trial attempt.
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

/// Lower-cased substrings used to classify child diagnostic output.
///
/// Matching is ordered: authentication patterns are checked first (they are
/// the most specific), then proxy, then network; anything unmatched is fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePatterns {
    pub network: Vec<String>,
    pub proxy: Vec<String>,
    pub authentication: Vec<String>,
}

impl Default for FailurePatterns {
    fn default() -> Self {
        Self {
            network: to_strings(&[
                "timed out",
                "timeout",
                "connection reset",
                "connection refused",
                "connection aborted",
                "temporary failure",
                "http error 403",
                "http error 429",
                "http error 500",
                "http error 502",
                "http error 503",
                "http error 504",
                "incomplete read",
                "unable to download webpage",
                "name or service not known",
            ]),
            proxy: to_strings(&[
                "proxy",
                "socks",
                "tunnel connection failed",
            ]),
            authentication: to_strings(&[
                "sign in",
                "login required",
                "cookies are required",
                "invalid cookies",
                "cookies are no longer valid",
                "use --cookies",
                "account",
                "members-only",
                "private video",
                "authentication",
            ]),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Container, codec, and language preferences feeding the format scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatPreferences {
    /// Containers scored +10 for complete streams.
    pub preferred_containers: Vec<String>,
    /// Containers scored +5 for complete streams.
    pub acceptable_containers: Vec<String>,
    /// Video codec family prefixes scored +5.
    pub preferred_video_codecs: Vec<String>,
    /// Audio codec family prefixes scored +5.
    pub preferred_audio_codecs: Vec<String>,
    /// Audio containers winning bitrate ties (`m4a` over `webm`).
    pub preferred_audio_containers: Vec<String>,
    /// Language tag whose audio tracks outrank plain bitrate.
    pub preferred_language: Option<String>,
}

impl Default for FormatPreferences {
    fn default() -> Self {
        Self {
            preferred_containers: to_strings(&["mp4", "m4a"]),
            acceptable_containers: to_strings(&["webm", "mkv"]),
            preferred_video_codecs: to_strings(&["avc1", "h264"]),
            preferred_audio_codecs: to_strings(&["mp4a", "aac"]),
            preferred_audio_containers: to_strings(&["m4a", "mp4a"]),
            preferred_language: None,
        }
    }
}
