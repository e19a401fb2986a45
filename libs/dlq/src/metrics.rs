//! Metrics for DLQ traffic.
//!
//! Counters and gauges are emitted through the `metrics` facade; installing
//! a recorder/exporter is the embedding service's concern.

use metrics::{counter, gauge};

/// Metric names as constants for consistency
pub mod names {
    pub const ENQUEUED: &str = "dlq_enqueued_total";
    pub const REQUEUED: &str = "dlq_requeued_total";
    /// Entries dropped after exceeding the requeue budget. Operators should
    /// alert on this: discard is permanent.
    pub const DISCARDED: &str = "dlq_discarded_total";
    pub const REDRIVEN: &str = "dlq_redriven_total";
    pub const CLAIMED: &str = "dlq_claimed_total";
    pub const DEPTH: &str = "dlq_depth";
    pub const PENDING: &str = "dlq_pending";
}

pub fn record_enqueued(stream: &str) {
    counter!(names::ENQUEUED, "stream" => stream.to_string()).increment(1);
}

pub fn record_requeued(stream: &str) {
    counter!(names::REQUEUED, "stream" => stream.to_string()).increment(1);
}

pub fn record_discarded(stream: &str) {
    counter!(names::DISCARDED, "stream" => stream.to_string()).increment(1);
}

pub fn record_redriven(stream: &str, count: u64) {
    counter!(names::REDRIVEN, "stream" => stream.to_string()).increment(count);
}

pub fn record_claimed(stream: &str, count: u64) {
    counter!(names::CLAIMED, "stream" => stream.to_string()).increment(count);
}

/// Update the stream-depth gauge.
pub fn set_depth(stream: &str, depth: f64) {
    gauge!(names::DEPTH, "stream" => stream.to_string()).set(depth);
}

/// Update the pending-entries gauge.
pub fn set_pending(stream: &str, pending: f64) {
    gauge!(names::PENDING, "stream" => stream.to_string()).set(pending);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_a_recorder_is_a_no_op() {
        // The facade drops everything when no recorder is installed.
        record_enqueued("test:dlq");
        record_discarded("test:dlq");
        record_redriven("test:dlq", 3);
        set_depth("test:dlq", 42.0);
    }
}
