//! Job Log Redaction
//!
//! Scrubs device secrets (line passwords, enable secrets, SNMP communities)
//! and bearer tokens from text before it is appended to a persisted job log.

use regex::Regex;
use std::sync::LazyLock;

static SECRET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(password|secret)(\s+\d)?\s+(\S+)").unwrap());
static COMMUNITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(snmp-server\s+community)\s+(\S+)").unwrap());
static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Bearer\s+[a-zA-Z0-9\-\._~+/]+=*").unwrap());

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    let redacted = SECRET_RE.replace_all(input, "${1}${2} [REDACTED]");
    let redacted = COMMUNITY_RE.replace_all(&redacted, "${1} [REDACTED]");
    BEARER_RE
        .replace_all(&redacted, "Bearer [REDACTED]")
        .into_owned()
}
