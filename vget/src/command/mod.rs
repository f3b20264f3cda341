//! Command-line construction for the extractor and processor binaries.
//!
//! This is the boundary between planning and execution: a plan plus a staging
//! location becomes an argument vector the supervisor can spawn. Argument
//! order follows the binaries' conventions (global flags, then inputs, then
//! outputs).

use std::path::Path;

use crate::config::{ExtractorConfig, ProcessorConfig, SupervisorLimits};

/// One invocable command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Full argument vector including the program, for attempt records.
    pub fn to_vec(&self) -> Vec<String> {
        let mut all = Vec::with_capacity(self.args.len() + 1);
        all.push(self.program.clone());
        all.extend(self.args.iter().cloned());
        all
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Builds extractor and processor invocations.
pub struct CommandBuilder<'a> {
    extractor: &'a ExtractorConfig,
    processor: &'a ProcessorConfig,
    limits: &'a SupervisorLimits,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(
        extractor: &'a ExtractorConfig,
        processor: &'a ProcessorConfig,
        limits: &'a SupervisorLimits,
    ) -> Self {
        Self {
            extractor,
            processor,
            limits,
        }
    }

    /// Listing probe: dump the available formats without downloading.
    pub fn probe(&self, url: &str, cookies: Option<&Path>) -> CommandSpec {
        let mut args = self.extractor_base(cookies);
        args.push("--dump-json".to_string());
        args.push("--no-download".to_string());
        args.push(url.to_string());
        CommandSpec::new(&self.extractor.binary_path, args)
    }

    /// Fetch the streams named by `selector` into `output_template`.
    ///
    /// `--newline` keeps progress output line-delimited so the supervisor can
    /// stream-parse it instead of fighting terminal rewrites.
    pub fn download(
        &self,
        url: &str,
        selector: &str,
        output_template: &Path,
        cookies: Option<&Path>,
    ) -> CommandSpec {
        let mut args = self.extractor_base(cookies);
        args.push("--newline".to_string());
        args.push("--no-playlist".to_string());
        args.push("-f".to_string());
        args.push(selector.to_string());
        args.push("-o".to_string());
        args.push(output_template.to_string_lossy().to_string());
        args.push(url.to_string());
        CommandSpec::new(&self.extractor.binary_path, args)
    }

    /// Merge a separately fetched video and audio track into one container,
    /// copying streams without re-encoding.
    pub fn merge(&self, video: &Path, audio: &Path, output: &Path) -> CommandSpec {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-i".to_string(),
            audio.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
        ];
        args.extend(self.processor.extra_args.iter().cloned());
        args.push(output.to_string_lossy().to_string());
        CommandSpec::new(&self.processor.binary_path, args)
    }

    fn extractor_base(&self, cookies: Option<&Path>) -> Vec<String> {
        let mut args = self.extractor.extra_args.clone();
        args.push("--socket-timeout".to_string());
        args.push(self.limits.network_timeout_secs.to_string());
        if let Some(path) = cookies {
            args.push("--cookies".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        args
    }
}
