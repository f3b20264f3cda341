//! Failure classification from child diagnostic output.
//!
//! The extractor reports everything as free text on stderr; the pattern
//! tables below turn that text into the error taxonomy. Pattern lists come
//! from configuration so site-specific phrasings can be added without a
//! release.

use crate::config::FailurePatterns;
use crate::error::{OperationError, snippet};

/// Classifies accumulated diagnostic text into an error kind.
pub struct FailureClassifier {
    network: Vec<String>,
    proxy: Vec<String>,
    authentication: Vec<String>,
}

impl FailureClassifier {
    pub fn new(patterns: &FailurePatterns) -> Self {
        let lower = |items: &[String]| items.iter().map(|p| p.to_lowercase()).collect();
        Self {
            network: lower(&patterns.network),
            proxy: lower(&patterns.proxy),
            authentication: lower(&patterns.authentication),
        }
    }

    /// Map diagnostic text to a failure kind.
    ///
    /// Authentication is checked first: an auth failure often also mentions a
    /// 403, and credential refresh is the only fix that works there. Proxy
    /// precedes network for the same reason. Anything unmatched is fatal and
    /// carries the (bounded) raw text.
    pub fn classify(&self, diagnostics: &str) -> OperationError {
        let text = diagnostics.to_lowercase();

        if matches_any(&text, &self.authentication) {
            return OperationError::Authentication(snippet(diagnostics));
        }
        if matches_any(&text, &self.proxy) {
            return OperationError::Proxy(snippet(diagnostics));
        }
        if matches_any(&text, &self.network) {
            return OperationError::Network(snippet(diagnostics));
        }
        OperationError::Fatal(snippet(diagnostics))
    }
}

fn matches_any(text: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| !p.is_empty() && text.contains(p))
}
