//! Screens for untrusted text: injection markers in market content and model
//! queries, query sanitation, and the source domain blacklist.

use reqwest::Url;

/// Phrases that try to redirect the arbitrator away from its directive.
pub const INJECTION_MARKERS: [&str; 11] = [
    "ignore previous instructions",
    "disregard",
    "jailbreak",
    "override",
    "forget your role",
    "you are now",
    "act as",
    "pretend to be",
    "new instructions",
    "system prompt",
    "developer mode",
];

/// Unmoderated or user-generated hosts whose results never reach the model.
pub const BLACKLISTED_DOMAINS: [&str; 12] = [
    "blogspot.com",
    "wordpress.com",
    "tumblr.com",
    "reddit.com",
    "twitter.com",
    "facebook.com",
    "instagram.com",
    "tiktok.com",
    "youtube.com",
    "pastebin.com",
    "4chan.org",
    "anonymous.com",
];

pub const MAX_QUERY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRejection {
    Injection,
    Empty,
    TooLong(usize),
}

impl std::fmt::Display for QueryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryRejection::Injection => write!(f, "query contains disallowed instructions"),
            QueryRejection::Empty => write!(f, "query is empty after sanitizing"),
            QueryRejection::TooLong(n) => {
                write!(f, "query is {} characters (max {})", n, MAX_QUERY_CHARS)
            }
        }
    }
}

pub fn contains_injection(text: &str) -> bool {
    let lower = text.to_lowercase();
    INJECTION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Keep ASCII letters, digits, whitespace, `-`, `_` and `.`; trim.
pub fn sanitize_query(raw: &str) -> Result<String, QueryRejection> {
    if contains_injection(raw) {
        return Err(QueryRejection::Injection);
    }

    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return Err(QueryRejection::Empty);
    }
    let len = cleaned.chars().count();
    if len > MAX_QUERY_CHARS {
        return Err(QueryRejection::TooLong(len));
    }
    Ok(cleaned.to_string())
}

/// True for blacklisted hosts and for anything that is not a parseable URL with a host.
pub fn is_blacklisted(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return true;
    };
    let Some(host) = parsed.host_str() else {
        return true;
    };
    let host = host.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    BLACKLISTED_DOMAINS.iter().any(|domain| host.contains(domain))
}
