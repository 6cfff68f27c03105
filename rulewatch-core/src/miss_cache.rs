use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::seconds_between;
use crate::config::EngineConfig;
use crate::event::{ChangeKind, FsEvent};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MissKey {
    path: PathBuf,
    kind: ChangeKind,
    is_directory: bool,
}

impl MissKey {
    fn of(event: &FsEvent) -> Self {
        Self {
            path: event.path.clone(),
            kind: event.kind,
            is_directory: event.is_directory,
        }
    }
}

/// Short-lived memo of event fingerprints that matched no rule.
///
/// Owned by a single event core; never shared across tasks.
#[derive(Debug)]
pub struct MissCache {
    ttl_secs: f64,
    max_entries: usize,
    entries: HashMap<MissKey, DateTime<Utc>>,
}

impl MissCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl_secs: ttl.as_secs_f64(),
            max_entries,
            entries: HashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.miss_cache_ttl(), config.miss_cache_max_entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// True when an identical event missed within the TTL.
    pub fn seen_miss(&self, event: &FsEvent, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&MissKey::of(event))
            .is_some_and(|at| seconds_between(now, *at) <= self.ttl_secs)
    }

    pub fn update(&mut self, event: &FsEvent, hit: bool, now: DateTime<Utc>) {
        let key = MissKey::of(event);
        if hit {
            self.entries.remove(&key);
            return;
        }
        self.entries.insert(key, now);
        if self.entries.len() > self.max_entries {
            let ttl = self.ttl_secs;
            self.entries.retain(|_, at| seconds_between(now, *at) <= ttl);
        }
    }
}
