//! Key selection policies.
//!
//! Selection works on a registry snapshot and is free of side effects; the
//! dispatcher is responsible for marking the chosen key as used.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::registry::ApiKey;

/// The five fixed selection policies, identified by the numeric ids used in
/// configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Strategy {
    /// 1: highest success rate.
    HighSuccessRate,
    /// 2: highest composite score.
    #[default]
    HighScore,
    /// 3: lowest requests per minute.
    LowRpm,
    /// 4: lowest tokens per minute.
    LowTpm,
    /// 5: highest balance.
    HighBalance,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::HighSuccessRate,
        Strategy::HighScore,
        Strategy::LowRpm,
        Strategy::LowTpm,
        Strategy::HighBalance,
    ];

    /// Maps a configured id to a strategy. Ids outside `1..=5` select
    /// [`Strategy::HighScore`], the general-purpose policy, so a typo in a
    /// settings file degrades to the default instead of rejecting requests.
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => Strategy::HighSuccessRate,
            2 => Strategy::HighScore,
            3 => Strategy::LowRpm,
            4 => Strategy::LowTpm,
            5 => Strategy::HighBalance,
            _ => Strategy::HighScore,
        }
    }

    pub const fn id(self) -> u8 {
        match self {
            Strategy::HighSuccessRate => 1,
            Strategy::HighScore => 2,
            Strategy::LowRpm => 3,
            Strategy::LowTpm => 4,
            Strategy::HighBalance => 5,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Strategy::HighSuccessRate => "high_success_rate",
            Strategy::HighScore => "high_score",
            Strategy::LowRpm => "low_rpm",
            Strategy::LowTpm => "low_tpm",
            Strategy::HighBalance => "high_balance",
        }
    }

    /// Orders two candidates; `Greater` means `a` is the better pick.
    fn compare(self, a: &ApiKey, b: &ApiKey) -> Ordering {
        match self {
            Strategy::HighSuccessRate => a.success_rate().total_cmp(&b.success_rate()),
            Strategy::HighScore => a.score().total_cmp(&b.score()),
            Strategy::LowRpm => b.requests_per_minute.cmp(&a.requests_per_minute),
            Strategy::LowTpm => b.tokens_per_minute.cmp(&a.tokens_per_minute),
            Strategy::HighBalance => a.balance.total_cmp(&b.balance),
        }
        .then_with(|| least_recently_used(a, b))
    }
}

impl From<u8> for Strategy {
    fn from(id: u8) -> Self {
        Strategy::from_id(id)
    }
}

impl From<Strategy> for u8 {
    fn from(strategy: Strategy) -> Self {
        strategy.id()
    }
}

/// Per-model strategy overrides.
///
/// Lookups try the exact model name first, then a lowercase index. When two
/// configured names differ only by case, the one that sorts first owns the
/// case-insensitive slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Strategy>",
    into = "BTreeMap<String, Strategy>"
)]
pub struct ModelStrategyMap {
    exact: BTreeMap<String, Strategy>,
    folded: HashMap<String, Strategy>,
}

impl ModelStrategyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, model: &str) -> Option<Strategy> {
        if let Some(strategy) = self.exact.get(model) {
            return Some(*strategy);
        }
        self.folded.get(&model.to_lowercase()).copied()
    }

    pub fn insert(&mut self, model: impl Into<String>, strategy: Strategy) {
        self.exact.insert(model.into(), strategy);
        self.rebuild_index();
    }

    pub fn remove(&mut self, model: &str) -> Option<Strategy> {
        let removed = self.exact.remove(model);
        self.rebuild_index();
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Strategy)> {
        self.exact.iter().map(|(name, s)| (name.as_str(), *s))
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.folded.clear();
        for (name, strategy) in &self.exact {
            self.folded.entry(name.to_lowercase()).or_insert(*strategy);
        }
    }
}

impl From<BTreeMap<String, Strategy>> for ModelStrategyMap {
    fn from(exact: BTreeMap<String, Strategy>) -> Self {
        let mut map = Self {
            exact,
            folded: HashMap::new(),
        };
        map.rebuild_index();
        map
    }
}

impl From<ModelStrategyMap> for BTreeMap<String, Strategy> {
    fn from(map: ModelStrategyMap) -> Self {
        map.exact
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub key: String,
    pub id: String,
    pub strategy: Strategy,
    /// Whether a per-model override decided the strategy.
    pub matched_override: bool,
    /// Whether the pick came from the least-recently-used fallback because
    /// no candidate cleared the balance threshold.
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no active API keys")]
    NoActiveKeys,
    #[error("every active API key was already tried")]
    Exhausted,
}

/// Resolves the strategy for `model`: exact override, case-insensitive
/// override, then the global default.
pub fn resolve_strategy(
    model: &str,
    overrides: &ModelStrategyMap,
    default: Strategy,
) -> (Strategy, bool) {
    match overrides.lookup(model) {
        Some(strategy) => (strategy, true),
        None => (default, false),
    }
}

/// Picks a key for `model` from `keys`, skipping disabled keys and anything
/// in `exclude`.
///
/// When no candidate clears `settings.min_balance_threshold`, the least
/// recently used enabled key is returned so the proxy keeps serving while
/// every key is poor. Only an empty set of enabled keys is an error.
pub fn select_key(
    keys: &[ApiKey],
    model: &str,
    settings: &Settings,
    exclude: &HashSet<String>,
) -> Result<Selection, SelectError> {
    let active: Vec<&ApiKey> = keys.iter().filter(|k| k.enabled).collect();
    if active.is_empty() {
        return Err(SelectError::NoActiveKeys);
    }

    let untried: Vec<&ApiKey> = active
        .into_iter()
        .filter(|k| !exclude.contains(&k.key))
        .collect();
    if untried.is_empty() {
        return Err(SelectError::Exhausted);
    }

    let (strategy, matched_override) =
        resolve_strategy(model, &settings.model_key_strategies, settings.default_strategy);
    debug!(
        model,
        strategy = strategy.name(),
        matched_override,
        "resolved key strategy"
    );

    let eligible = untried
        .iter()
        .copied()
        .filter(|k| k.balance >= settings.min_balance_threshold);

    if let Some(best) = pick_best(eligible, |a, b| strategy.compare(a, b)) {
        return Ok(Selection {
            key: best.key.clone(),
            id: best.id.clone(),
            strategy,
            matched_override,
            fallback: false,
        });
    }

    warn!(
        model,
        strategy = strategy.name(),
        threshold = settings.min_balance_threshold,
        "no key clears the balance threshold, falling back to least recently used"
    );

    let fallback = pick_best(untried.iter().copied(), least_recently_used)
        .ok_or(SelectError::Exhausted)?;

    Ok(Selection {
        key: fallback.key.clone(),
        id: fallback.id.clone(),
        strategy,
        matched_override,
        fallback: true,
    })
}

/// Returns the first candidate that no later candidate beats.
fn pick_best<'a, I, F>(candidates: I, compare: F) -> Option<&'a ApiKey>
where
    I: IntoIterator<Item = &'a ApiKey>,
    F: Fn(&ApiKey, &ApiKey) -> Ordering,
{
    let mut best: Option<&ApiKey> = None;
    for candidate in candidates {
        best = match best {
            Some(current) if compare(candidate, current) != Ordering::Greater => Some(current),
            _ => Some(candidate),
        };
    }
    best
}

fn least_recently_used(a: &ApiKey, b: &ApiKey) -> Ordering {
    b.last_used_at.cmp(&a.last_used_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, balance: f64) -> ApiKey {
        let mut key = ApiKey::new(name, name);
        key.balance = balance;
        key
    }

    fn settings_with(default: Strategy, threshold: f64) -> Settings {
        Settings {
            default_strategy: default,
            min_balance_threshold: threshold,
            ..Settings::default()
        }
    }

    fn pick(keys: &[ApiKey], model: &str, settings: &Settings) -> Selection {
        select_key(keys, model, settings, &HashSet::new()).unwrap()
    }

    #[test]
    fn high_balance_picks_richest_key() {
        let keys = vec![key("A", 10.0), key("B", 50.0), key("C", 30.0)];
        let settings = settings_with(Strategy::HighBalance, 1.0);
        let selection = pick(&keys, "any", &settings);
        assert_eq!(selection.key, "B");
        assert!(!selection.fallback);
    }

    #[test]
    fn low_tpm_picks_quietest_key() {
        let mut keys = vec![key("A", 10.0), key("B", 10.0), key("C", 10.0)];
        keys[0].tokens_per_minute = 500;
        keys[1].tokens_per_minute = 100;
        keys[2].tokens_per_minute = 300;
        let settings = settings_with(Strategy::LowTpm, 1.0);
        assert_eq!(pick(&keys, "m", &settings).key, "B");
    }

    #[test]
    fn low_tpm_falls_back_to_least_recently_used_when_all_keys_are_poor() {
        let mut keys = vec![key("A", 0.1), key("B", 0.2), key("C", 0.3)];
        keys[0].tokens_per_minute = 500;
        keys[0].last_used_at = 300;
        keys[1].tokens_per_minute = 100;
        keys[1].last_used_at = 200;
        keys[2].tokens_per_minute = 300;
        keys[2].last_used_at = 100;
        let settings = settings_with(Strategy::LowTpm, 1.0);

        let selection = pick(&keys, "m", &settings);
        assert_eq!(selection.key, "C");
        assert!(selection.fallback);
    }

    #[test]
    fn low_rpm_picks_least_busy_key() {
        let mut keys = vec![key("A", 5.0), key("B", 5.0)];
        keys[0].requests_per_minute = 12;
        keys[1].requests_per_minute = 3;
        let settings = settings_with(Strategy::LowRpm, 1.0);
        assert_eq!(pick(&keys, "m", &settings).key, "B");
    }

    #[test]
    fn high_success_rate_breaks_ties_by_least_recent_use() {
        let mut keys = vec![key("A", 5.0), key("B", 5.0), key("C", 5.0)];
        keys[0].success_count = 9;
        keys[0].failure_count = 1;
        keys[0].last_used_at = 50;
        keys[1].success_count = 4;
        keys[1].last_used_at = 100;
        keys[2].success_count = 2;
        keys[2].last_used_at = 20;
        let settings = settings_with(Strategy::HighSuccessRate, 1.0);
        assert_eq!(pick(&keys, "m", &settings).key, "C");
    }

    #[test]
    fn high_score_prefers_reliable_well_funded_idle_keys() {
        let mut keys = vec![key("A", 5.0), key("B", 50.0)];
        keys[0].requests_per_minute = 40;
        keys[1].requests_per_minute = 2;
        let settings = settings_with(Strategy::HighScore, 1.0);
        assert_eq!(pick(&keys, "m", &settings).key, "B");
    }

    #[test]
    fn keys_below_threshold_are_skipped_when_others_qualify() {
        let keys = vec![key("A", 0.5), key("B", 2.0)];
        let settings = settings_with(Strategy::HighSuccessRate, 1.0);
        let selection = pick(&keys, "m", &settings);
        assert_eq!(selection.key, "B");
        assert!(!selection.fallback);
    }

    #[test]
    fn model_override_applies_only_to_that_model() {
        let mut keys = vec![key("A", 10.0), key("B", 50.0), key("C", 30.0)];
        keys[1].failure_count = 20;
        keys[1].requests_per_minute = 100;

        let mut settings = settings_with(Strategy::HighScore, 1.0);
        settings
            .model_key_strategies
            .insert("gpt-x", Strategy::HighBalance);

        let overridden = pick(&keys, "gpt-x", &settings);
        assert_eq!(overridden.key, "B");
        assert_eq!(overridden.strategy, Strategy::HighBalance);
        assert!(overridden.matched_override);

        let default = pick(&keys, "other-model", &settings);
        assert_eq!(default.strategy, Strategy::HighScore);
        assert!(!default.matched_override);
        assert_eq!(default.key, "C");
    }

    #[test]
    fn override_lookup_is_case_insensitive_after_exact_match() {
        let mut overrides = ModelStrategyMap::new();
        overrides.insert("Qwen/Qwen2.5-7B", Strategy::LowTpm);
        overrides.insert("qwen/qwen2.5-7b", Strategy::LowRpm);
        overrides.insert("BAAI/bge-m3", Strategy::HighBalance);

        assert_eq!(overrides.lookup("Qwen/Qwen2.5-7B"), Some(Strategy::LowTpm));
        assert_eq!(overrides.lookup("qwen/qwen2.5-7b"), Some(Strategy::LowRpm));
        assert_eq!(overrides.lookup("baai/BGE-M3"), Some(Strategy::HighBalance));
        assert_eq!(overrides.lookup("unknown"), None);

        let (strategy, matched) = resolve_strategy("BAAI/BGE-M3", &overrides, Strategy::LowRpm);
        assert_eq!(strategy, Strategy::HighBalance);
        assert!(matched);
    }

    #[test]
    fn unknown_strategy_ids_use_high_score() {
        assert_eq!(Strategy::from_id(0), Strategy::HighScore);
        assert_eq!(Strategy::from_id(9), Strategy::HighScore);
        for strategy in Strategy::ALL {
            assert_eq!(Strategy::from_id(strategy.id()), strategy);
        }
    }

    #[test]
    fn disabled_and_excluded_keys_are_never_selected() {
        let mut keys = vec![key("A", 100.0), key("B", 50.0), key("C", 10.0)];
        keys[0].enabled = false;
        let settings = settings_with(Strategy::HighBalance, 1.0);
        let exclude: HashSet<String> = ["B".to_string()].into_iter().collect();

        let selection = select_key(&keys, "m", &settings, &exclude).unwrap();
        assert_eq!(selection.key, "C");
    }

    #[test]
    fn empty_or_disabled_pool_reports_no_active_keys() {
        let settings = Settings::default();
        assert_eq!(
            select_key(&[], "m", &settings, &HashSet::new()),
            Err(SelectError::NoActiveKeys)
        );

        let mut keys = vec![key("A", 100.0)];
        keys[0].enabled = false;
        assert_eq!(
            select_key(&keys, "m", &settings, &HashSet::new()),
            Err(SelectError::NoActiveKeys)
        );
    }

    #[test]
    fn fully_excluded_pool_reports_exhausted() {
        let keys = vec![key("A", 100.0), key("B", 0.0)];
        let settings = Settings::default();
        let exclude: HashSet<String> = ["A".to_string(), "B".to_string()].into_iter().collect();
        assert_eq!(
            select_key(&keys, "m", &settings, &exclude),
            Err(SelectError::Exhausted)
        );
    }

    #[test]
    fn enabled_key_above_threshold_is_always_found() {
        for strategy in Strategy::ALL {
            let mut keys = vec![key("A", 0.0), key("B", 3.0), key("C", 0.5)];
            keys[2].enabled = false;
            let settings = settings_with(strategy, 1.0);
            let selection = pick(&keys, "m", &settings);
            assert_eq!(selection.key, "B", "strategy {}", strategy.name());
        }
    }
}
