//! Period-over-period comparison.

use crate::funnel::FunnelReport;
use crate::period::ComparisonPeriods;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub value: f64,
    pub direction: Direction,
}

impl Trend {
    pub const FLAT: Trend = Trend {
        value: 0.0,
        direction: Direction::Neutral,
    };
}

/// Percentage change from `previous` to `current`. Total over all inputs:
/// negative or non-finite values are treated as zero.
pub fn trend(current: f64, previous: f64) -> Trend {
    let sanitize = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
    let current = sanitize(current);
    let previous = sanitize(previous);

    if previous == 0.0 {
        return if current > 0.0 {
            Trend {
                value: 100.0,
                direction: Direction::Up,
            }
        } else {
            Trend::FLAT
        };
    }

    let value = (current - previous).abs() / previous * 100.0;
    let direction = if current > previous {
        Direction::Up
    } else if current < previous {
        Direction::Down
    } else {
        Direction::Neutral
    };
    Trend {
        value: if value.is_finite() { value } else { 0.0 },
        direction,
    }
}

pub fn count_trend(current: u64, previous: u64) -> Trend {
    trend(current as f64, previous as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTrend {
    pub metric: String,
    pub current: f64,
    pub previous: f64,
    pub trend: Trend,
}

impl MetricTrend {
    pub fn new(metric: impl Into<String>, current: f64, previous: f64) -> Self {
        Self {
            metric: metric.into(),
            current,
            previous,
            trend: trend(current, previous),
        }
    }
}

/// Current vs. previous funnel, with a trend per stage and per headline metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelComparison {
    pub periods: ComparisonPeriods,
    pub current: FunnelReport,
    pub previous: FunnelReport,
    pub stages: Vec<MetricTrend>,
    pub metrics: Vec<MetricTrend>,
}

/// Totals outside the funnel that are compared alongside it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodTotals {
    pub revenue: f64,
    pub orders: u64,
}

pub fn compare_funnels(
    periods: ComparisonPeriods,
    current: FunnelReport,
    previous: FunnelReport,
    current_totals: PeriodTotals,
    previous_totals: PeriodTotals,
) -> FunnelComparison {
    let stages = current
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let prev = previous.steps.get(i).map_or(0, |s| s.count);
            MetricTrend::new(step.label.clone(), step.count as f64, prev as f64)
        })
        .collect();

    let metrics = vec![
        MetricTrend::new(
            "conversion_rate",
            current.overall_conversion_pct,
            previous.overall_conversion_pct,
        ),
        MetricTrend::new("revenue", current_totals.revenue, previous_totals.revenue),
        MetricTrend::new(
            "orders",
            current_totals.orders as f64,
            previous_totals.orders as f64,
        ),
    ];

    FunnelComparison {
        periods,
        current,
        previous,
        stages,
        metrics,
    }
}
