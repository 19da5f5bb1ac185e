//! Rolling-window and per-day request aggregates.
//!
//! The window feeds RPM/TPM into scoring. Daily buckets are reporting only
//! and are keyed by the local calendar date.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::Serialize;

use crate::registry::UsageSample;

/// Span of the rolling window used for RPM/TPM.
pub const WINDOW_SECS: i64 = 60;
/// Days of daily buckets kept in memory.
pub const DAILY_RETENTION_DAYS: i64 = 31;

pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens: u64,
}

impl WindowStats {
    fn add(&mut self, sample: &Sample) {
        self.requests += 1;
        self.tokens = self.tokens.saturating_add(sample.tokens);
        if sample.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    fn merge(&mut self, other: &WindowStats) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.failures += other.failures;
        self.tokens = self.tokens.saturating_add(other.tokens);
    }

    /// The window is one minute long, so its totals are the per-minute rates.
    pub fn as_usage(&self) -> UsageSample {
        UsageSample {
            requests_per_minute: u32::try_from(self.requests).unwrap_or(u32::MAX),
            tokens_per_minute: self.tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelDaily {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens: u64,
    pub models: BTreeMap<String, ModelDaily>,
}

impl DailyStats {
    fn new(date: NaiveDate) -> Self {
        Self {
            date: date.format(DAY_FORMAT).to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, model: &str, success: bool, tokens: u64) {
        self.requests += 1;
        self.tokens = self.tokens.saturating_add(tokens);
        let entry = self.models.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.tokens = entry.tokens.saturating_add(tokens);
        if success {
            self.successes += 1;
            entry.successes += 1;
        } else {
            self.failures += 1;
            entry.failures += 1;
        }
    }

    fn absorb(&mut self, other: DailyStats) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.failures += other.failures;
        self.tokens = self.tokens.saturating_add(other.tokens);
        for (model, counts) in other.models {
            let entry = self.models.entry(model).or_default();
            entry.requests += counts.requests;
            entry.successes += counts.successes;
            entry.failures += counts.failures;
            entry.tokens = entry.tokens.saturating_add(counts.tokens);
        }
    }
}

/// Local calendar date that `at` falls on.
pub fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DAY_FORMAT).ok()
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    success: bool,
    tokens: u64,
}

#[derive(Debug, Default)]
struct Inner {
    windows: HashMap<String, VecDeque<Sample>>,
    daily: BTreeMap<NaiveDate, DailyStats>,
}

impl Inner {
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(WINDOW_SECS);
        self.windows.retain(|_, samples| {
            while samples.front().is_some_and(|s| s.at <= cutoff) {
                samples.pop_front();
            }
            !samples.is_empty()
        });
    }

    fn trim_days(&mut self) {
        let Some(latest) = self.daily.keys().next_back().copied() else {
            return;
        };
        let oldest_kept = latest - Duration::days(DAILY_RETENTION_DAYS - 1);
        self.daily.retain(|day, _| *day >= oldest_kept);
    }
}

#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: Mutex<Inner>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(
        &self,
        key: &str,
        model: &str,
        success: bool,
        tokens: u64,
        at: DateTime<Utc>,
    ) {
        let mut inner = self.lock();
        let samples = inner.windows.entry(key.to_string()).or_default();
        let sample = Sample {
            at,
            success,
            tokens,
        };
        // Attempts finish out of order; keep the deque sorted for pruning.
        let pos = samples.partition_point(|s| s.at <= at);
        samples.insert(pos, sample);

        let day = local_day(at);
        inner
            .daily
            .entry(day)
            .or_insert_with(|| DailyStats::new(day))
            .record(model, success, tokens);
        inner.trim_days();
    }

    /// Totals for `key` over the last [`WINDOW_SECS`] seconds.
    pub fn current_window(&self, key: &str, now: DateTime<Utc>) -> WindowStats {
        let mut inner = self.lock();
        inner.prune(now);
        let mut stats = WindowStats::default();
        if let Some(samples) = inner.windows.get(key) {
            samples
                .iter()
                .filter(|s| s.at <= now)
                .for_each(|s| stats.add(s));
        }
        stats
    }

    /// Window totals for every key with recent traffic.
    pub fn current_windows(&self, now: DateTime<Utc>) -> HashMap<String, WindowStats> {
        let mut inner = self.lock();
        inner.prune(now);
        inner
            .windows
            .iter()
            .map(|(key, samples)| {
                let mut stats = WindowStats::default();
                samples
                    .iter()
                    .filter(|s| s.at <= now)
                    .for_each(|s| stats.add(s));
                (key.clone(), stats)
            })
            .collect()
    }

    pub fn current_total(&self, now: DateTime<Utc>) -> WindowStats {
        let mut total = WindowStats::default();
        for stats in self.current_windows(now).values() {
            total.merge(stats);
        }
        total
    }

    pub fn daily(&self, day: NaiveDate) -> Option<DailyStats> {
        self.lock().daily.get(&day).cloned()
    }

    /// Every retained day, oldest first.
    pub fn daily_all(&self) -> Vec<DailyStats> {
        self.lock().daily.values().cloned().collect()
    }

    /// Merges persisted daily buckets into memory, typically at startup.
    pub fn seed_daily(&self, days: Vec<DailyStats>) {
        let mut inner = self.lock();
        for stats in days {
            let Some(day) = parse_day(&stats.date) else {
                continue;
            };
            inner
                .daily
                .entry(day)
                .or_insert_with(|| DailyStats::new(day))
                .absorb(stats);
        }
        inner.trim_days();
    }

    /// Drops the rolling window of a removed key.
    pub fn forget_key(&self, key: &str) {
        self.lock().windows.remove(key);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn window_counts_recent_requests_only() {
        let stats = StatsAggregator::new();
        stats.record_request("k1", "m", true, 100, at(0));
        stats.record_request("k1", "m", false, 0, at(30));
        stats.record_request("k1", "m", true, 50, at(50));
        stats.record_request("k2", "m", true, 10, at(50));

        let window = stats.current_window("k1", at(55));
        assert_eq!(
            window,
            WindowStats {
                requests: 3,
                successes: 2,
                failures: 1,
                tokens: 150
            }
        );

        let later = stats.current_window("k1", at(75));
        assert_eq!(later.requests, 2);
        assert_eq!(later.tokens, 50);
        assert_eq!(later.as_usage().requests_per_minute, 2);

        assert_eq!(stats.current_total(at(75)).requests, 3);
        assert_eq!(stats.current_window("k1", at(200)), WindowStats::default());
    }

    #[test]
    fn late_samples_keep_window_ordered() {
        let stats = StatsAggregator::new();
        stats.record_request("k", "m", true, 1, at(40));
        stats.record_request("k", "m", true, 2, at(10));
        stats.record_request("k", "m", true, 4, at(30));

        assert_eq!(stats.current_window("k", at(45)).tokens, 7);
        assert_eq!(stats.current_window("k", at(75)).tokens, 5);
    }

    #[test]
    fn daily_bucket_tracks_models() {
        let stats = StatsAggregator::new();
        stats.record_request("k1", "chat", true, 10, at(0));
        stats.record_request("k2", "chat", false, 0, at(1));
        stats.record_request("k2", "embed", true, 5, at(2));

        let day = local_day(at(0));
        let bucket = stats.daily(day).unwrap();
        assert_eq!(bucket.date, day.format(DAY_FORMAT).to_string());
        assert_eq!(bucket.requests, 3);
        assert_eq!(bucket.successes, 2);
        assert_eq!(bucket.failures, 1);
        assert_eq!(bucket.tokens, 15);
        assert_eq!(bucket.models["chat"].requests, 2);
        assert_eq!(bucket.models["embed"].tokens, 5);
    }

    #[test]
    fn seeded_days_merge_and_old_days_expire() {
        let stats = StatsAggregator::new();
        let today = local_day(at(0));
        let old = today - Duration::days(DAILY_RETENTION_DAYS + 5);

        let mut seeded = DailyStats::new(today);
        seeded.record("chat", true, 40);
        stats.seed_daily(vec![seeded, DailyStats::new(old)]);
        stats.record_request("k", "chat", true, 2, at(0));

        let days = stats.daily_all();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].requests, 2);
        assert_eq!(days[0].tokens, 42);
        assert_eq!(days[0].models["chat"].successes, 2);
    }

    #[test]
    fn parse_day_accepts_iso_dates() {
        assert_eq!(
            parse_day("2025-03-07"),
            NaiveDate::from_ymd_opt(2025, 3, 7)
        );
        assert_eq!(parse_day("07/03/2025"), None);
    }
}
