//! Dead-letter entry records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Categorization of failure types for routing decisions.
///
/// String-valued on the wire; unknown values decode as `Transient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    #[serde(rename = "transient")]
    Transient,
    #[serde(rename = "permanent")]
    Permanent,
    #[serde(rename = "poison")]
    Poison,
    #[serde(rename = "exhausted")]
    ResourceExhausted,
    #[serde(rename = "dependency")]
    DependencyFailure,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Poison => "poison",
            Self::ResourceExhausted => "exhausted",
            Self::DependencyFailure => "dependency",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            "poison" => Some(Self::Poison),
            "exhausted" => Some(Self::ResourceExhausted),
            "dependency" => Some(Self::DependencyFailure),
            _ => None,
        }
    }

    /// Parse with the decode fallback: unknown values become `Transient`.
    pub fn parse_lossy(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::Transient)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for FailureCategory {
    fn default() -> Self {
        Self::Transient
    }
}

/// Caller-supplied description of the originating failure.
///
/// There is no ambient exception to capture, so the caller names the failure
/// class and optionally attaches whatever string best describes the call
/// site; an empty traceback is acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    /// Symbolic name of the failure class (e.g. `"TimeoutError"`).
    pub error_type: String,
    pub message: String,
    pub traceback: String,
}

impl FailureDetail {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }
}

/// A frozen record of one failed message.
///
/// Entries are immutable once constructed; "mutation" produces a new entry
/// (see [`DeadLetterEntry::with_requeue_count`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Caller-supplied or generated unique identifier.
    pub id: String,

    /// Broker-assigned stream position; empty until the entry is
    /// materialised in the stream.
    pub stream_id: String,

    /// Raw message payload, preserved bit-exact.
    pub payload: Vec<u8>,

    /// Symbolic name of the originating failure class.
    pub error_type: String,

    pub error_message: String,

    pub error_traceback: String,

    /// Retry attempts before DLQ routing.
    pub retry_count: u32,

    /// Times re-enqueued from the DLQ.
    pub requeue_count: u32,

    pub category: FailureCategory,

    /// Name of the originating queue.
    pub source_queue: String,

    /// When the failure was captured.
    pub timestamp: DateTime<Utc>,

    /// Arbitrary caller headers.
    pub metadata: HashMap<String, String>,
}

impl DeadLetterEntry {
    /// A copy of this entry with a different requeue count.
    pub fn with_requeue_count(&self, requeue_count: u32) -> Self {
        Self {
            requeue_count,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_wire_values() {
        assert_eq!(FailureCategory::Transient.as_str(), "transient");
        assert_eq!(FailureCategory::Permanent.as_str(), "permanent");
        assert_eq!(FailureCategory::Poison.as_str(), "poison");
        assert_eq!(FailureCategory::ResourceExhausted.as_str(), "exhausted");
        assert_eq!(FailureCategory::DependencyFailure.as_str(), "dependency");
    }

    #[test]
    fn test_category_round_trip() {
        for category in [
            FailureCategory::Transient,
            FailureCategory::Permanent,
            FailureCategory::Poison,
            FailureCategory::ResourceExhausted,
            FailureCategory::DependencyFailure,
        ] {
            assert_eq!(FailureCategory::parse(category.as_str()), Some(category));
        }
    }

    #[test]
    fn test_unknown_category_coerces_to_transient() {
        assert_eq!(FailureCategory::parse("gremlins"), None);
        assert_eq!(
            FailureCategory::parse_lossy("gremlins"),
            FailureCategory::Transient
        );
    }

    #[test]
    fn test_with_requeue_count_leaves_original_untouched() {
        let entry = DeadLetterEntry {
            id: "entry-1".to_string(),
            stream_id: "1704067200000-0".to_string(),
            payload: b"bytes".to_vec(),
            error_type: "TimeoutError".to_string(),
            error_message: "upstream timed out".to_string(),
            error_traceback: String::new(),
            retry_count: 2,
            requeue_count: 0,
            category: FailureCategory::Transient,
            source_queue: "translations".to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        };

        let bumped = entry.with_requeue_count(1);
        assert_eq!(bumped.requeue_count, 1);
        assert_eq!(entry.requeue_count, 0);
        assert_eq!(bumped.payload, entry.payload);
    }

    #[test]
    fn test_failure_detail_builder() {
        let detail = FailureDetail::new("ValueError", "bad input").with_traceback("at worker.rs:42");
        assert_eq!(detail.error_type, "ValueError");
        assert_eq!(detail.traceback, "at worker.rs:42");

        let bare = FailureDetail::new("IoError", "broken pipe");
        assert!(bare.traceback.is_empty());
    }
}
