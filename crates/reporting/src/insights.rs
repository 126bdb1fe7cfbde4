//! Benchmark insights: compares stage-over-stage rates against the benchmark
//! table and produces ranked, human-readable findings.

use crate::benchmarks::{tier, BenchmarkTable, ColorTier, Transition};
use crate::funnel::{drop_offs, ratio_pct, DropOff, FunnelStep};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Tip,
    /// Never produced by the generator; reserved for consumers.
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub recommendation: Option<String>,
}

pub struct InsightGenerator {
    benchmarks: BenchmarkTable,
}

impl InsightGenerator {
    pub fn new(benchmarks: BenchmarkTable) -> Self {
        Self { benchmarks }
    }

    /// Insights in fixed order: start, completion, capture, biggest drop-off.
    pub fn generate(&self, steps: &[FunnelStep]) -> Vec<Insight> {
        if steps.len() < 2 {
            return Vec::new();
        }

        let mut insights: Vec<Insight> = Transition::ORDERED
            .iter()
            .filter_map(|t| self.transition_insight(*t, steps))
            .collect();

        if let Some(tip) = self.biggest_drop_off_tip(&drop_offs(steps)) {
            insights.push(tip);
        }

        insights.retain(|i| i.severity != Severity::Success);
        insights
    }

    fn transition_insight(&self, transition: Transition, steps: &[FunnelStep]) -> Option<Insight> {
        let index = transition.from_stage();
        let from = steps.get(index)?;
        let to = steps.get(index + 1)?;
        // Nothing entered the step, so there is nothing to diagnose.
        if from.count == 0 {
            return None;
        }

        let threshold = self.benchmarks.for_transition(transition);
        let rate = ratio_pct(to.count, from.count);
        let lost = from.count.saturating_sub(to.count);
        let severity = match tier(&threshold, rate) {
            ColorTier::Success => return None,
            ColorTier::Warning => Severity::Warning,
            ColorTier::Error => Severity::Critical,
        };

        let lost = format_count(lost);
        let total = format_count(from.count);
        let good = threshold.good;
        let critical = severity == Severity::Critical;

        let insight = match transition {
            Transition::StartRate => Insight {
                severity,
                title: if critical {
                    "Low quiz start rate".to_string()
                } else {
                    "Quiz start rate below benchmark".to_string()
                },
                message: format!(
                    "Only {rate:.1}% of visitors start the quiz (benchmark: {good}%). \
                     You are losing {lost} of {total} potential leads before the first question."
                ),
                recommendation: Some(if critical {
                    "Move the quiz call-to-action above the fold and cut the intro copy to one line.".to_string()
                } else {
                    "Test a more specific headline that promises a personal result.".to_string()
                }),
            },
            Transition::CompletionRate => Insight {
                severity,
                title: if critical {
                    "Low quiz completion rate".to_string()
                } else {
                    "Quiz completion rate below benchmark".to_string()
                },
                message: format!(
                    "{rate:.1}% of quiz takers finish the quiz (benchmark: {good}%). \
                     {lost} of {total} people who started dropped out before the last question."
                ),
                recommendation: Some(if critical {
                    "Remove optional questions and show a progress bar so people know how close they are.".to_string()
                } else {
                    "Review per-question abandonment and simplify the slowest question.".to_string()
                }),
            },
            Transition::CaptureRate => Insight {
                severity,
                title: if critical {
                    "Low email capture rate".to_string()
                } else {
                    "Email capture rate below benchmark".to_string()
                },
                message: format!(
                    "{rate:.1}% of people who complete the quiz leave their email (benchmark: {good}%). \
                     {lost} of {total} finished quizzes ended without a lead."
                ),
                recommendation: if critical {
                    Some("Explain what the results contain right above the email field and drop extra form fields.".to_string())
                } else {
                    None
                },
            },
        };
        Some(insight)
    }

    /// One tip for the largest drop-off above the configured minimum. Ties go
    /// to the earliest stage.
    fn biggest_drop_off_tip(&self, drops: &[DropOff]) -> Option<Insight> {
        let mut biggest: Option<&DropOff> = None;
        for drop in drops {
            if biggest.map_or(true, |b| drop.percentage > b.percentage) {
                biggest = Some(drop);
            }
        }
        let drop = biggest?;
        if drop.percentage <= self.benchmarks.tip_min_drop_off_pct() {
            return None;
        }

        Some(Insight {
            severity: Severity::Tip,
            title: format!("Biggest drop-off: {} → {}", drop.from_label, drop.to_label),
            message: format!(
                "{:.1}% of sessions ({}) are lost between \"{}\" and \"{}\". \
                 This step has the most room for improvement.",
                drop.percentage,
                format_count(drop.lost),
                drop.from_label,
                drop.to_label
            ),
            recommendation: None,
        })
    }
}

impl Default for InsightGenerator {
    fn default() -> Self {
        Self::new(BenchmarkTable::default())
    }
}

/// Render a count with thousands separators: `1234567` → `"1,234,567"`.
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
