//! Idle pings
//!
//! A ping is a `process-hits` task with no hits whose headers carry the
//! wall clock at emission. The worker treats that timestamp as observed
//! time, so an idle stream still closes sessions.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

use crate::hits::HIT_PROCESSING_TASK_NAME;
use crate::queue::task::Task;

pub const IS_PING_HEADER: &str = "is-ping";
pub const PING_TIMESTAMP_HEADER: &str = "ping-timestamp";

pub fn ping_headers(now: DateTime<Utc>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(IS_PING_HEADER.to_string(), "true".to_string());
    headers.insert(
        PING_TIMESTAMP_HEADER.to_string(),
        now.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    );
    headers
}

/// Ping task for the hit processing pipeline
pub fn process_hits_ping_task(now: DateTime<Utc>) -> Task {
    Task::new(HIT_PROCESSING_TASK_NAME, ping_headers(now), Vec::new())
}

/// Whether the headers mark a ping, and its timestamp.
///
/// A malformed timestamp makes the task a regular one.
pub fn is_ping(headers: &BTreeMap<String, String>) -> (bool, Option<DateTime<Utc>>) {
    if headers.get(IS_PING_HEADER).map(String::as_str) != Some("true") {
        return (false, None);
    }

    match headers
        .get(PING_TIMESTAMP_HEADER)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    {
        Some(ts) => (true, Some(ts.with_timezone(&Utc))),
        None => (false, None),
    }
}
