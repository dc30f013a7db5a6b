//! Stream task schema.
//!
//! A [`StreamTask`] is the unit published to a service's persistent task
//! stream: an `action_name` that selects the handler, an opaque string
//! payload interpreted by that handler, and an expiry after which the bus
//! may garbage-collect the message. The bus assigns each appended task a
//! [`MessageId`] that is strictly increasing within its stream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A task appended to a service's stream.
///
/// JSON layout: `{"actionName": …, "data": …, "expiry": millis}`. The
/// payload is opaque to the bus; only the accepter keyed on `action_name`
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTask {
    /// Handler key; matched against registered accepters.
    pub action_name: String,
    /// Opaque payload string.
    pub data: String,
    /// Relative expiry in milliseconds from publish time. Tasks older than
    /// this are garbage-collected by the bus.
    #[serde(rename = "expiry")]
    pub expiry_ms: u64,
}

impl StreamTask {
    /// Convenience constructor.
    #[must_use]
    pub fn new(action_name: impl Into<String>, data: impl Into<String>, expiry_ms: u64) -> Self {
        Self {
            action_name: action_name.into(),
            data: data.into(),
            expiry_ms,
        }
    }
}

/// Bus-assigned identifier of an appended task.
///
/// Ordered first by publish time, then by a per-millisecond sequence number,
/// so ids are strictly increasing within a stream. Rendered as
/// `"<millis>-<seq>"` (the shape stream stores use), which also serves as a
/// stable key component for distributed retry counters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId {
    /// Publish wall-clock time in milliseconds.
    pub millis: i64,
    /// Disambiguates ids published within the same millisecond.
    pub seq: u64,
}

impl MessageId {
    /// Creates a message id from its parts.
    #[must_use]
    pub fn new(millis: i64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// Error parsing a `"<millis>-<seq>"` message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessageIdError;

impl fmt::Display for ParseMessageIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("message id must look like \"<millis>-<seq>\"")
    }
}

impl std::error::Error for ParseMessageIdError {}

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s.split_once('-').ok_or(ParseMessageIdError)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| ParseMessageIdError)?,
            seq: seq.parse().map_err(|_| ParseMessageIdError)?,
        })
    }
}
