//! In-memory stats accumulation.
//!
//! Grounded on `original_source/.../redirector/manager.py`'s `stats`
//! handling: each worker periodically reports a `k=v&k=v&...` blob tagged
//! with its own timestamp; the manager folds every reported value into
//! `cache[timestamp][key]` (spec.md §4.4 "Stats format"). Out of scope
//! per spec.md §1 is the HTML rendering of this data (the management page
//! itself); this module only owns the recording side the reactor and
//! classifier manager feed.

use std::collections::BTreeMap;

/// Accumulates `stats` replies keyed by the timestamp the worker reported,
/// each holding every value reported for a key during that tick, in report
/// order — `storeStats`' `d.setdefault(k, []).append(v)`: several workers
/// can report the same key for the same timestamp, and none of those
/// reports should clobber another.
#[derive(Debug, Default)]
pub struct Recorder {
    by_timestamp: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            by_timestamp: BTreeMap::new(),
        }
    }

    /// Folds `pairs` (already split by
    /// [`crate::classifier::protocol::parse_stats`]) into the bucket for
    /// `timestamp`, appending to any prior values for a repeated key.
    pub fn record(&mut self, timestamp: &str, pairs: &[(String, String)]) {
        let bucket = self.by_timestamp.entry(timestamp.to_owned()).or_default();
        for (key, value) in pairs {
            bucket.entry(key.clone()).or_default().push(value.clone());
        }
    }

    /// The most recent timestamp bucket, if any have been recorded.
    pub fn latest(&self) -> Option<(&str, &BTreeMap<String, Vec<String>>)> {
        self.by_timestamp.iter().next_back().map(|(ts, values)| (ts.as_str(), values))
    }

    /// Number of distinct timestamps currently retained.
    pub fn len(&self) -> usize {
        self.by_timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_timestamp.is_empty()
    }

    /// Drops every bucket older than the `keep` most recent timestamps, so
    /// a long-running proxy doesn't accumulate an unbounded history.
    pub fn trim(&mut self, keep: usize) {
        while self.by_timestamp.len() > keep {
            if let Some(oldest) = self.by_timestamp.keys().next().cloned() {
                self.by_timestamp.remove(&oldest);
            } else {
                break;
            }
        }
    }
}
