// ABOUTME: Counter names and recording helpers for the sync engine
// ABOUTME: Facade only; whichever recorder the host installs receives the values

use ::metrics::counter;

pub const EVENTS_RECEIVED: &str = "slackline_events_received_total";
pub const UNKNOWN_EVENTS: &str = "slackline_unknown_events_total";
pub const RECONNECTS: &str = "slackline_reconnects_total";
pub const RESUME_FALLBACKS: &str = "slackline_resume_fallbacks_total";
pub const BACKFILL_PASSES: &str = "slackline_backfill_passes_total";
pub const HASH_BUMPS: &str = "slackline_hash_bumps_total";
pub const ORPHANED_FAILURES: &str = "slackline_orphaned_failures_total";

/// One inbound stream event, labelled by its `type`.
pub fn record_event(kind: &str) {
    counter!(EVENTS_RECEIVED, "kind" => kind.to_string()).increment(1);
}

pub fn record_unknown_event() {
    counter!(UNKNOWN_EVENTS).increment(1);
}

pub fn record_reconnect(workspace: &str) {
    counter!(RECONNECTS, "workspace" => workspace.to_string()).increment(1);
}

/// A held resume URL was rejected and a full connect followed.
pub fn record_resume_fallback(workspace: &str) {
    counter!(RESUME_FALLBACKS, "workspace" => workspace.to_string()).increment(1);
}

pub fn record_backfill_pass() {
    counter!(BACKFILL_PASSES).increment(1);
}

pub fn record_hash_bump() {
    counter!(HASH_BUMPS).increment(1);
}

pub fn record_orphaned_failure() {
    counter!(ORPHANED_FAILURES).increment(1);
}
