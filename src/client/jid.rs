//! Protocol addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ClientError;

/// An addressable protocol identifier, `user@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    /// Build a user address from a phone number and the configured server.
    ///
    /// A leading `+` is dropped; the rest must be ASCII digits.
    pub fn from_phone(mobile_no: &str, server: &str) -> Result<Self, ClientError> {
        let digits = mobile_no.trim();
        let digits = digits.strip_prefix('+').unwrap_or(digits);

        if digits.is_empty() {
            return Err(ClientError::InvalidAddress {
                address: mobile_no.to_string(),
                reason: "phone number is empty".to_string(),
            });
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClientError::InvalidAddress {
                address: mobile_no.to_string(),
                reason: "phone number must contain only digits".to_string(),
            });
        }

        Ok(Self::new(digits, server))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl FromStr for Jid {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ClientError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let (user, server) = s.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
        if user.is_empty() {
            return Err(invalid("empty user part"));
        }
        if server.is_empty() || server.contains('@') {
            return Err(invalid("malformed server part"));
        }
        Ok(Self::new(user, server))
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
