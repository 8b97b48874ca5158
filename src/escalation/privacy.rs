//! Privacy filter for payloads leaving the host
//!
//! Applied to everything sent on the cloud fallback path.

use once_cell::sync::Lazy;
use regex::Regex;

/// Cap on the filtered payload, in characters
pub const MAX_CLOUD_PAYLOAD_CHARS: usize = 1500;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email regex"));

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("valid ipv4 regex"));

static HOME_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:/home/|/Users/|~/)[^\s/]*").expect("valid home path regex"));

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:sk|key|pk|ghp|xox[abp])[-_][A-Za-z0-9_-]{8,}").expect("valid token regex")
});

static DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{6,}").expect("valid digit run regex"));

/// Redact personal and secret-looking material, then truncate
pub fn filter_for_cloud(text: &str) -> String {
    // Tokens first: they may contain digit runs
    let text = TOKEN_RE.replace_all(text, "[TOKEN]");
    let text = EMAIL_RE.replace_all(&text, "[EMAIL]");
    let text = IPV4_RE.replace_all(&text, "[IP]");
    let text = HOME_PATH_RE.replace_all(&text, "[HOME]");
    let text = DIGITS_RE.replace_all(&text, "[NUMBER]");

    let mut out: String = text.chars().take(MAX_CLOUD_PAYLOAD_CHARS).collect();
    if text.chars().count() > MAX_CLOUD_PAYLOAD_CHARS {
        out.push_str(" [truncated]");
    }
    out
}
