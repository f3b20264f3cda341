//! Netscape cookie-file support.
//!
//! The extractor consumes credentials as a Netscape-format cookie file:
//! seven tab-separated fields per line (domain, subdomain flag, path, secure
//! flag, expiry epoch, name, value). Credential refreshers produce the same
//! format, so this model is the shared currency between them.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use crate::error::{OperationError, Result};

const FILE_HEADER: &str = "# Netscape HTTP Cookie File";

/// One cookie line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// `None` for session cookies (expiry field `0`).
    pub expires: Option<DateTime<Utc>>,
    pub name: String,
    pub value: String,
}

impl CookieRecord {
    /// Whether this cookie applies to `host`, honoring the subdomain flag
    /// and leading-dot domains.
    pub fn matches_domain(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        let host = host.trim_start_matches('.');
        if host.eq_ignore_ascii_case(domain) {
            return true;
        }
        if self.include_subdomains || self.domain.starts_with('.') {
            let suffix = format!(".{}", domain.to_lowercase());
            return host.to_lowercase().ends_with(&suffix);
        }
        false
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(at) if at <= now)
    }

    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.domain,
            flag(self.include_subdomains),
            self.path,
            flag(self.secure),
            self.expires.map(|at| at.timestamp()).unwrap_or(0),
            self.name,
            self.value
        )
    }
}

fn flag(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

/// An in-memory cookie file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieFile {
    pub records: Vec<CookieRecord>,
}

impl CookieFile {
    /// Parse cookie-file text. Comments, blank lines, and the `#HttpOnly_`
    /// prefix some exporters add are tolerated; malformed lines are skipped
    /// with a warning rather than failing the whole file.
    pub fn parse(text: &str) -> Self {
        let mut records = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.strip_prefix("#HttpOnly_").unwrap_or(raw);
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_record(line) {
                Some(record) => records.push(record),
                None => warn!(line = index + 1, "skipping malformed cookie line"),
            }
        }
        Self { records }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| OperationError::io(path, source))?;
        Ok(Self::parse(&text))
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_string())
            .await
            .map_err(|source| OperationError::io(path, source))
    }

    /// Cookies applicable to `host` that have not expired.
    pub fn for_domain(&self, host: &str, now: DateTime<Utc>) -> Vec<&CookieRecord> {
        self.records
            .iter()
            .filter(|r| r.matches_domain(host) && !r.is_expired(now))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl std::fmt::Display for CookieFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{FILE_HEADER}")?;
        for record in &self.records {
            writeln!(f, "{}", record.to_line())?;
        }
        Ok(())
    }
}

fn parse_record(line: &str) -> Option<CookieRecord> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 7 {
        return None;
    }

    let expiry: i64 = fields[4].trim().parse().ok()?;
    let expires = if expiry == 0 {
        None
    } else {
        Utc.timestamp_opt(expiry, 0).single()
    };

    Some(CookieRecord {
        domain: fields[0].to_string(),
        include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
        path: fields[2].to_string(),
        secure: fields[3].eq_ignore_ascii_case("TRUE"),
        expires,
        name: fields[5].to_string(),
        value: fields[6].to_string(),
    })
}
