use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ChannelError;

/// Serialized origin (`scheme://host[:port]`) of a browsing context.
///
/// Default ports are elided and hosts lowercased, so two spellings of the
/// same origin compare equal. Opaque origins (`null`, `data:`) are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(String);

impl Origin {
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let parsed = url::Url::parse(raw.trim())
            .map_err(|e| ChannelError::InvalidOrigin(format!("{raw}: {e}")))?;
        match parsed.origin() {
            origin @ url::Origin::Tuple(..) => Ok(Self(origin.ascii_serialization())),
            url::Origin::Opaque(_) => Err(ChannelError::InvalidOrigin(format!(
                "{raw}: opaque origins are not allowed"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part, for logs and allowlist checks.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.0)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// `targetOrigin` of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOrigin {
    Exact(Origin),
    /// `"*"`; only used when a legacy embedder is explicitly allowed.
    Any,
}

impl TargetOrigin {
    pub fn admits(&self, origin: &Origin) -> bool {
        match self {
            Self::Exact(expected) => expected == origin,
            Self::Any => true,
        }
    }
}

impl fmt::Display for TargetOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(origin) => origin.fmt(f),
            Self::Any => f.write_str("*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_default_ports_and_case() {
        let a = Origin::parse("https://Game.Example:443").unwrap();
        let b = Origin::parse("https://game.example/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://game.example");
        assert_eq!(
            Origin::parse("http://localhost:3000").unwrap().as_str(),
            "http://localhost:3000"
        );
    }

    #[test]
    fn lookalike_hosts_differ() {
        let real = Origin::parse("https://game.example").unwrap();
        let fake = Origin::parse("https://game.example.evil.com").unwrap();
        assert_ne!(real, fake);
        assert!(!TargetOrigin::Exact(real).admits(&fake));
        assert!(TargetOrigin::Any.admits(&fake));
    }

    #[test]
    fn rejects_opaque_and_garbage() {
        assert!(Origin::parse("null").is_err());
        assert!(Origin::parse("data:text/html,hi").is_err());
        assert!(Origin::parse("not an origin").is_err());
    }
}
