//! Domain types shared across the read path

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ReadError;

/// Upstream network identifier. Every cache, counter and client is partitioned by it.
pub type ChainId = u64;

/// A 20-byte account address, always held in lowercase `0x` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse a query parameter, naming it in the error on failure.
    pub fn parse_param(name: &'static str, value: &str) -> Result<Self, ReadError> {
        value
            .parse()
            .map_err(|reason: String| ReadError::InvalidParameter { name, reason })
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| format!("'{}' is not 0x-prefixed", trimmed))?;
        if digits.len() != 40 {
            return Err(format!(
                "'{}' must have 40 hex digits, found {}",
                trimmed,
                digits.len()
            ));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| format!("'{}' is not valid hex: {}", trimmed, e))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One position owned by a user in a lending pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub address: Address,
    pub lending_pool_address: Address,
}

impl Position {
    pub fn new(chain_id: ChainId, address: Address, lending_pool_address: Address) -> Self {
        Self {
            id: format!("{}-{}", chain_id, address),
            address,
            lending_pool_address,
        }
    }
}
