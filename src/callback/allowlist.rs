//! Allowlist for session callback and redirect targets.
//!
//! A caller-supplied `callback_uri` is only ever contacted when it matches a
//! configured `host[/path-prefix]` entry.
//!
//! ```text
//! callback_uri ──► Parse URL ──► Scheme ok? ──► Host match? ──► Path prefix match?
//!                     │
//!                     └─► reject userinfo, bad percent-encoding, encoded separators
//! ```

use std::fmt;

/// Reason a callback target was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    InvalidUrl(String),
    HostNotAllowed(String),
    PathNotAllowed { host: String, path: String },
    EmptyAllowlist,
    /// Plain HTTP to anything other than a loopback host.
    InsecureScheme(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::InvalidUrl(reason) => write!(f, "Invalid URL: {}", reason),
            DenyReason::HostNotAllowed(host) => write!(f, "Host not in allowlist: {}", host),
            DenyReason::PathNotAllowed { host, path } => {
                write!(f, "Path not allowed for host {}: {}", host, path)
            }
            DenyReason::EmptyAllowlist => write!(f, "No callback hosts in allowlist"),
            DenyReason::InsecureScheme(scheme) => {
                write!(f, "Insecure scheme: {} (only HTTPS allowed)", scheme)
            }
        }
    }
}

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Check whether a concrete host matches an allowlist entry.
///
/// Supports exact hosts and wildcard suffixes of the form `*.example.com`;
/// the wildcard does not match the bare suffix.
pub fn host_matches(host: &str, entry: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    let entry = entry.trim().to_ascii_lowercase();
    if host.is_empty() || entry.is_empty() {
        return false;
    }

    if let Some(suffix) = entry.strip_prefix("*.") {
        if suffix.is_empty() || host == suffix {
            return false;
        }
        host.ends_with(&format!(".{suffix}"))
    } else {
        host == entry
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    host: String,
    path_prefix: Option<String>,
}

impl Entry {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw
            .strip_prefix("https://")
            .or_else(|| raw.strip_prefix("http://"))
            .unwrap_or(raw);
        let (host, path) = match raw.find('/') {
            Some(index) => (&raw[..index], Some(&raw[index..])),
            None => (raw, None),
        };
        // Entries name hosts; a port would never match `host_str()`.
        let host = match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
            _ => host,
        };
        if host.is_empty() {
            return None;
        }

        let path_prefix = match path {
            Some(path) => match normalize_path(path) {
                Ok(normalized) if normalized != "/" => Some(normalized),
                Ok(_) => None,
                Err(_) => return None,
            },
            None => None,
        };
        Some(Self {
            host: host.to_ascii_lowercase(),
            path_prefix,
        })
    }

    fn path_matches(&self, path: &str) -> bool {
        match self.path_prefix.as_deref() {
            None => true,
            Some(prefix) if prefix.ends_with('/') => path.starts_with(prefix),
            Some(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// Validates callback targets against `host[/path-prefix]` entries.
#[derive(Debug, Clone, Default)]
pub struct CallbackAllowlist {
    entries: Vec<Entry>,
}

impl CallbackAllowlist {
    /// Unparseable entries are skipped with a warning.
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let entries = entries
            .iter()
            .filter_map(|raw| {
                let parsed = Entry::parse(raw.as_ref());
                if parsed.is_none() {
                    tracing::warn!(entry = raw.as_ref(), "Ignoring invalid callback allowlist entry");
                }
                parsed
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse `url` and check it against the allowlist.
    pub fn validate(&self, url: &str) -> Result<url::Url, DenyReason> {
        if self.entries.is_empty() {
            return Err(DenyReason::EmptyAllowlist);
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| DenyReason::InvalidUrl(format!("URL parse failed: {e}")))?;

        // Reject userinfo (user:pass@host) to prevent host-confusion bypasses.
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(DenyReason::InvalidUrl(
                "URL contains userinfo (@) which is not allowed".to_string(),
            ));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| DenyReason::InvalidUrl("Empty host".to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_ascii_lowercase();

        match parsed.scheme() {
            "https" => {}
            "http" if LOOPBACK_HOSTS.contains(&host.as_str()) => {}
            other => return Err(DenyReason::InsecureScheme(other.to_string())),
        }

        let path = normalize_path(parsed.path()).map_err(DenyReason::InvalidUrl)?;

        let host_entries: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|entry| host_matches(&host, &entry.host))
            .collect();
        if host_entries.is_empty() {
            return Err(DenyReason::HostNotAllowed(host));
        }
        if host_entries.iter().any(|entry| entry.path_matches(&path)) {
            Ok(parsed)
        } else {
            Err(DenyReason::PathNotAllowed { host, path })
        }
    }
}

/// Resolve `.`/`..` segments after percent-decoding each segment.
fn normalize_path(path: &str) -> Result<String, String> {
    let mut segments: Vec<String> = Vec::new();
    for raw_segment in path.split('/') {
        if !has_valid_percent_encoding(raw_segment) {
            return Err(format!(
                "Invalid percent-encoding in path segment: {raw_segment}"
            ));
        }

        let segment = urlencoding::decode(raw_segment)
            .map_err(|_| format!("Invalid percent-encoding in path segment: {raw_segment}"))?;
        let segment = segment.as_ref();

        if segment.contains('/') || segment.contains('\\') {
            return Err("Path segment contains encoded path separator".to_string());
        }

        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment.to_string()),
        }
    }

    let mut result = String::with_capacity(path.len().max(1));
    result.push('/');
    result.push_str(&segments.join("/"));
    if path.len() > 1 && path.ends_with('/') && !result.ends_with('/') {
        result.push('/');
    }
    Ok(result)
}

fn has_valid_percent_encoding(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}
