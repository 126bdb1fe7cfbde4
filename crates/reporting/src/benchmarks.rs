//! Central benchmark table: one `{good, warning}` pair per funnel transition,
//! shared by stage colouring and insight generation.

use funnel_core::config::{BenchmarkConfig, Threshold};
use funnel_core::{FunnelError, FunnelResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named stage-over-stage transitions of the quiz funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Visited → started the quiz.
    StartRate,
    /// Started → completed the quiz.
    CompletionRate,
    /// Completed → left an email.
    CaptureRate,
}

impl Transition {
    pub const ORDERED: [Transition; 3] = [
        Transition::StartRate,
        Transition::CompletionRate,
        Transition::CaptureRate,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Transition::StartRate => "start_rate",
            Transition::CompletionRate => "completion_rate",
            Transition::CaptureRate => "capture_rate",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ORDERED.into_iter().find(|t| t.key() == key)
    }

    /// Index of the stage this transition leaves from.
    pub fn from_stage(&self) -> usize {
        match self {
            Transition::StartRate => 0,
            Transition::CompletionRate => 1,
            Transition::CaptureRate => 2,
        }
    }
}

/// Display tier of a funnel stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorTier {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkTable {
    thresholds: BTreeMap<String, Threshold>,
    tip_min_drop_off_pct: f64,
}

impl BenchmarkTable {
    /// Build from configuration. Known transitions missing from the config
    /// keep their default thresholds.
    pub fn from_config(config: &BenchmarkConfig) -> FunnelResult<Self> {
        let mut thresholds = BenchmarkConfig::default().thresholds;
        for (key, threshold) in &config.thresholds {
            validate(key, threshold)?;
            thresholds.insert(key.clone(), *threshold);
        }
        if !config.tip_min_drop_off_pct.is_finite()
            || !(0.0..=100.0).contains(&config.tip_min_drop_off_pct)
        {
            return Err(FunnelError::Config(format!(
                "tip_min_drop_off_pct must be within 0..=100, got {}",
                config.tip_min_drop_off_pct
            )));
        }
        Ok(Self {
            thresholds,
            tip_min_drop_off_pct: config.tip_min_drop_off_pct,
        })
    }

    pub fn threshold(&self, key: &str) -> Option<Threshold> {
        self.thresholds.get(key).copied()
    }

    pub fn for_transition(&self, transition: Transition) -> Threshold {
        self.threshold(transition.key())
            .unwrap_or_else(|| default_threshold(transition))
    }

    pub fn tip_min_drop_off_pct(&self) -> f64 {
        self.tip_min_drop_off_pct
    }

    /// Tier for a stage-over-stage rate. Stages without a benchmark are
    /// always `Success`.
    pub fn classify(&self, key: Option<&str>, rate_pct: f64) -> ColorTier {
        match key.and_then(|k| self.threshold(k)) {
            Some(t) => tier(&t, rate_pct),
            None => ColorTier::Success,
        }
    }
}

impl Default for BenchmarkTable {
    fn default() -> Self {
        let config = BenchmarkConfig::default();
        Self {
            thresholds: config.thresholds,
            tip_min_drop_off_pct: config.tip_min_drop_off_pct,
        }
    }
}

pub fn tier(threshold: &Threshold, rate_pct: f64) -> ColorTier {
    if rate_pct >= threshold.good {
        ColorTier::Success
    } else if rate_pct >= threshold.warning {
        ColorTier::Warning
    } else {
        ColorTier::Error
    }
}

fn default_threshold(transition: Transition) -> Threshold {
    BenchmarkConfig::default().thresholds[transition.key()]
}

fn validate(key: &str, t: &Threshold) -> FunnelResult<()> {
    let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
    if !in_range(t.good) || !in_range(t.warning) {
        return Err(FunnelError::Config(format!(
            "benchmark '{key}' thresholds must be within 0..=100"
        )));
    }
    if t.warning > t.good {
        return Err(FunnelError::Config(format!(
            "benchmark '{key}' warning ({}) exceeds good ({})",
            t.warning, t.good
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_industry_benchmarks() {
        let table = BenchmarkTable::default();
        assert_eq!(
            table.for_transition(Transition::StartRate),
            Threshold { good: 60.0, warning: 40.0 }
        );
        assert_eq!(
            table.for_transition(Transition::CompletionRate),
            Threshold { good: 70.0, warning: 50.0 }
        );
        assert_eq!(
            table.for_transition(Transition::CaptureRate),
            Threshold { good: 85.0, warning: 70.0 }
        );
    }

    #[test]
    fn test_classify_boundaries() {
        let table = BenchmarkTable::default();
        let key = Some("start_rate");
        assert_eq!(table.classify(key, 60.0), ColorTier::Success);
        assert_eq!(table.classify(key, 59.9), ColorTier::Warning);
        assert_eq!(table.classify(key, 40.0), ColorTier::Warning);
        assert_eq!(table.classify(key, 39.9), ColorTier::Error);
        assert_eq!(table.classify(None, 0.0), ColorTier::Success);
        assert_eq!(table.classify(Some("unknown"), 0.0), ColorTier::Success);
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let mut config = BenchmarkConfig::default();
        config.thresholds.clear();
        config.thresholds.insert(
            "start_rate".into(),
            Threshold {
                good: 50.0,
                warning: 30.0,
            },
        );
        let table = BenchmarkTable::from_config(&config).unwrap();
        assert_eq!(table.for_transition(Transition::StartRate).good, 50.0);
        assert_eq!(table.for_transition(Transition::CaptureRate).good, 85.0);
    }

    #[test]
    fn test_inverted_threshold_is_rejected() {
        let mut config = BenchmarkConfig::default();
        config.thresholds.insert(
            "capture_rate".into(),
            Threshold {
                good: 50.0,
                warning: 80.0,
            },
        );
        assert!(matches!(
            BenchmarkTable::from_config(&config),
            Err(FunnelError::Config(_))
        ));
    }

    #[test]
    fn test_transition_keys_round_trip() {
        for t in Transition::ORDERED {
            assert_eq!(Transition::from_key(t.key()), Some(t));
        }
    }
}
