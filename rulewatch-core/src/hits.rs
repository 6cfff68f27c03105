//! Per-rule hit history backing rate limits and settle times.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::seconds_between;
use crate::event::ChangeKind;
use crate::rules::Rule;

/// Which rule field a limit check reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitKind {
    SettleTime,
    RateLimit,
}

impl LimitKind {
    /// Settle time is checked first so that rate limiting only counts events
    /// that survived settling.
    pub const CHECK_ORDER: [LimitKind; 2] = [LimitKind::SettleTime, LimitKind::RateLimit];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::SettleTime => "settle time",
            LimitKind::RateLimit => "rate limit",
        }
    }

    /// `(count, period_secs)` for this field of `rule`. Settle time behaves
    /// like a limit of one hit per settle period.
    pub fn limit_of(&self, rule: &Rule) -> (i64, f64) {
        match self {
            LimitKind::SettleTime => (1, rule.settle().as_secs_f64()),
            LimitKind::RateLimit => {
                let rate = rule.rate();
                (rate.count, rate.period.as_secs_f64())
            }
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HitEntry {
    pub path: PathBuf,
    pub change: ChangeKind,
    pub reference: String,
    pub at: DateTime<Utc>,
}

/// Snapshot returned by [`RuleHitRegistry::query`].
#[derive(Clone, Debug, PartialEq)]
pub struct HitSnapshot {
    pub history: Vec<HitEntry>,
    pub hit_count: i64,
    pub hit_period: f64,
}

type HitKey = (String, String);

/// Mutex-guarded hit history keyed by `(tenant, rule_id)`.
#[derive(Default)]
pub struct RuleHitRegistry {
    inner: Mutex<HashMap<HitKey, Vec<HitEntry>>>,
}

impl fmt::Debug for RuleHitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RuleHitRegistry");
        match self.inner.try_lock() {
            Some(guard) => debug.field("rules", &guard.len()),
            None => debug.field("rules", &"<locked>"),
        };
        debug.finish()
    }
}

fn key_of(rule: &Rule) -> HitKey {
    (rule.tenant.clone(), rule.rule_id.clone())
}

impl RuleHitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hit, then expire entries older than the longer of the rule's
    /// rate period and settle period.
    pub fn record(
        &self,
        rule: &Rule,
        path: &Path,
        change: ChangeKind,
        reference: &str,
        at: DateTime<Utc>,
    ) {
        let (_, rate_period) = LimitKind::RateLimit.limit_of(rule);
        let (_, settle_period) = LimitKind::SettleTime.limit_of(rule);
        let max_period = rate_period.max(settle_period);

        let mut guard = self.inner.lock();
        let history = guard.entry(key_of(rule)).or_default();
        history.push(HitEntry {
            path: path.to_path_buf(),
            change,
            reference: reference.to_string(),
            at,
        });
        history.retain(|entry| seconds_between(at, entry.at) <= max_period);
    }

    pub fn query(&self, rule: &Rule, kind: LimitKind) -> HitSnapshot {
        let (hit_count, hit_period) = kind.limit_of(rule);
        let history = self
            .inner
            .lock()
            .get(&key_of(rule))
            .cloned()
            .unwrap_or_default();
        HitSnapshot {
            history,
            hit_count,
            hit_period,
        }
    }

    fn path_hits(&self, rule: &Rule, path: &Path, kind: LimitKind) -> HitSnapshot {
        let mut snapshot = self.query(rule, kind);
        snapshot.history.retain(|entry| entry.path == path);
        snapshot
    }

    /// Whether `path` already reached the limit `kind` of `rule` at `at`.
    pub fn above_limit(&self, rule: &Rule, path: &Path, kind: LimitKind, at: DateTime<Utc>) -> bool {
        let snapshot = self.path_hits(rule, path, kind);
        if snapshot.hit_count <= 0 || snapshot.hit_period <= 0.0 {
            return false;
        }
        let recent = snapshot
            .history
            .iter()
            .filter(|entry| seconds_between(at, entry.at) <= snapshot.hit_period)
            .count() as i64;
        recent >= snapshot.hit_count
    }

    /// Seconds still to wait at `at` before `path` counts as settled; zero or
    /// less means settled.
    pub fn time_to_settle(&self, rule: &Rule, path: &Path, settle_secs: f64, at: DateTime<Utc>) -> f64 {
        let snapshot = self.path_hits(rule, path, LimitKind::SettleTime);
        snapshot
            .history
            .iter()
            .map(|entry| seconds_between(at, entry.at))
            .filter(|age| *age <= snapshot.hit_period)
            .reduce(f64::min)
            .map_or(0.0, |youngest| settle_secs - youngest)
    }

    /// Human readable hit summary used in skip messages.
    pub fn describe(&self, rule: &Rule, path: &Path, kind: LimitKind) -> String {
        let snapshot = self.path_hits(rule, path, kind);
        format!(
            "found {} entries in trigger history and limit is {} per {} s",
            snapshot.history.len(),
            snapshot.hit_count,
            snapshot.hit_period
        )
    }
}
