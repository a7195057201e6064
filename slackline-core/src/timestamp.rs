// ABOUTME: Server-assigned two-part message timestamp, totally ordered by (seconds, sequence)
// ABOUTME: Keeps the original text for display, hashing and round-tripping back to the API

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid conversation timestamp '{0}'")]
pub struct TimestampParseError(pub String);

/// `"1700000000.000200"` style key of a message within a conversation.
///
/// Equality, ordering and hashing only look at the numeric parts, so
/// `"5.0"` and `"5.000"` are the same timestamp.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationTimestamp {
    major: u64,
    minor: u64,
    raw: String,
}

impl ConversationTimestamp {
    pub fn parse(raw: &str) -> Result<Self, TimestampParseError> {
        raw.parse()
    }

    /// `"0.0"`, older than any real message.
    pub fn zero() -> Self {
        Self {
            major: 0,
            minor: 0,
            raw: "0.0".to_string(),
        }
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ConversationTimestamp {
    type Err = TimestampParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || TimestampParseError(raw.to_string());
        let (major, minor) = raw.split_once('.').unwrap_or((raw, "0"));
        if major.is_empty() || minor.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            raw: raw.to_string(),
        })
    }
}

impl TryFrom<String> for ConversationTimestamp {
    type Error = TimestampParseError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<ConversationTimestamp> for String {
    fn from(ts: ConversationTimestamp) -> Self {
        ts.raw
    }
}

impl PartialEq for ConversationTimestamp {
    fn eq(&self, other: &Self) -> bool {
        (self.major, self.minor) == (other.major, other.minor)
    }
}

impl Eq for ConversationTimestamp {}

impl Hash for ConversationTimestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.major, self.minor).hash(state);
    }
}

impl PartialOrd for ConversationTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConversationTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl fmt::Display for ConversationTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for ConversationTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationTimestamp({})", self.raw)
    }
}
