//! Validated Jira ticket keys
//!
//! A [`TicketKey`] is the only form in which a key reaches routing or path
//! construction, so a malformed key is rejected here and nowhere else.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const MAX_KEY_LEN: usize = 64;

static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z][A-Z0-9_]*)-([0-9]+)$").expect("static ticket key regex"));

/// A ticket key of the form `<PREFIX>-<NUMBER>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketKey {
    key: String,
    prefix_len: usize,
}

impl TicketKey {
    /// Parse and normalize a key. Surrounding whitespace is ignored and the
    /// key is upper-cased before validation.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(Error::Validation("ticket key is empty".to_string()));
        }
        if normalized.len() > MAX_KEY_LEN {
            return Err(Error::Validation(format!(
                "ticket key is longer than {} characters",
                MAX_KEY_LEN
            )));
        }

        let prefix_len = KEY_PATTERN
            .captures(&normalized)
            .and_then(|caps| caps.get(1))
            .map(|m| m.end())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "invalid ticket key format: {:?} (expected PROJECT-123)",
                    raw
                ))
            })?;

        Ok(Self {
            key: normalized,
            prefix_len,
        })
    }

    /// Project prefix, e.g. `ABC` for `ABC-100`
    pub fn prefix(&self) -> &str {
        &self.key[..self.prefix_len]
    }

    /// Issue number part, e.g. `100` for `ABC-100`
    pub fn number(&self) -> &str {
        &self.key[self.prefix_len + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl FromStr for TicketKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for TicketKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

impl Serialize for TicketKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key)
    }
}
