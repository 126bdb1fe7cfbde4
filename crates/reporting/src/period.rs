//! Period resolution: turns an optional requested window into concrete
//! boundaries, plus the immediately preceding window of equal length.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use funnel_core::config::ReportingConfig;
use funnel_core::types::Period;
use funnel_core::{FunnelError, FunnelResult};
use serde::{Deserialize, Serialize};

/// Smallest representable step between two adjacent windows.
pub fn tick() -> Duration {
    Duration::milliseconds(1)
}

/// A caller-supplied `{start, end}` window, not yet validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Parse ISO 8601 bounds. Accepts RFC 3339 timestamps or `YYYY-MM-DD`
    /// dates; a date-only end covers the whole day.
    pub fn parse(start: &str, end: &str) -> FunnelResult<Self> {
        Ok(Self {
            start: parse_bound(start, false)?,
            end: parse_bound(end, true)?,
        })
    }
}

fn parse_bound(raw: &str, inclusive_end: bool) -> FunnelResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| FunnelError::Validation(format!("unparseable date '{raw}'")))?;
    let time = if inclusive_end {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| FunnelError::Validation(format!("unrepresentable date '{raw}'")))
}

/// Current and previous windows for period-over-period comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonPeriods {
    pub current: Period,
    pub previous: Period,
}

#[derive(Debug, Clone)]
pub struct PeriodResolver {
    default_days: i64,
}

impl PeriodResolver {
    pub fn new(default_days: i64) -> Self {
        Self {
            default_days: default_days.max(1),
        }
    }

    pub fn from_config(config: &ReportingConfig) -> Self {
        Self::new(config.default_period_days)
    }

    pub fn resolve(&self, window: Option<DateWindow>) -> FunnelResult<Period> {
        self.resolve_at(window, Utc::now())
    }

    /// Resolve against an explicit "now", so callers can pin the default window.
    pub fn resolve_at(&self, window: Option<DateWindow>, now: DateTime<Utc>) -> FunnelResult<Period> {
        match window {
            None => Ok(Period {
                start: now - Duration::days(self.default_days),
                end: now,
            }),
            Some(w) if w.start > w.end => Err(FunnelError::InvalidRange {
                start: w.start,
                end: w.end,
            }),
            Some(w) => Ok(Period {
                start: w.start,
                end: w.end,
            }),
        }
    }

    pub fn resolve_comparison(
        &self,
        window: Option<DateWindow>,
        previous: Option<DateWindow>,
    ) -> FunnelResult<ComparisonPeriods> {
        self.resolve_comparison_at(window, previous, Utc::now())
    }

    /// Resolve the current window and its predecessor. An explicit previous
    /// window must end strictly before the current one starts.
    pub fn resolve_comparison_at(
        &self,
        window: Option<DateWindow>,
        previous: Option<DateWindow>,
        now: DateTime<Utc>,
    ) -> FunnelResult<ComparisonPeriods> {
        let current = self.resolve_at(window, now)?;
        let previous = match previous {
            Some(p) => {
                let p = self.resolve_at(Some(p), now)?;
                if p.end >= current.start {
                    return Err(FunnelError::Validation(
                        "previous period overlaps the current period".into(),
                    ));
                }
                p
            }
            None => previous_period(&current),
        };
        Ok(ComparisonPeriods { current, previous })
    }
}

impl Default for PeriodResolver {
    fn default() -> Self {
        Self::from_config(&ReportingConfig::default())
    }
}

/// The window of identical length ending one tick before `current` starts.
pub fn previous_period(current: &Period) -> Period {
    let previous_end = current.start - tick();
    Period {
        start: previous_end - current.length(),
        end: previous_end,
    }
}
