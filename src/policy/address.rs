//! Starknet contract address normalization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PolicyError;

/// Number of hex digits in a fully padded felt.
const FELT_HEX_DIGITS: usize = 64;

/// A contract address in canonical form: `0x` followed by 64 lowercase hex
/// digits, left-padded with zeros.
///
/// `0xAAA`, `0xaaa` and `0x0000...0aaa` all normalize to the same value, so
/// equality, ordering and hashing are format-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContractAddress(String);

impl ContractAddress {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let trimmed = raw.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| PolicyError::InvalidAddress(raw.to_string()))?;

        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PolicyError::InvalidAddress(raw.to_string()));
        }

        let significant = hex.trim_start_matches('0');
        if significant.len() > FELT_HEX_DIGITS {
            return Err(PolicyError::InvalidAddress(raw.to_string()));
        }

        Ok(Self(format!(
            "0x{:0>width$}",
            significant.to_ascii_lowercase(),
            width = FELT_HEX_DIGITS
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compact form without leading zeros, for logs and prompts.
    pub fn short(&self) -> String {
        let digits = self.0[2..].trim_start_matches('0');
        if digits.is_empty() {
            "0x0".to_string()
        } else {
            format!("0x{digits}")
        }
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContractAddress {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContractAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContractAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
