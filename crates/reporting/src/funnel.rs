//! Funnel aggregation: monotonically filters sessions through ordered stages
//! and derives per-stage percentages, drop-offs and colour tiers.

use crate::benchmarks::{BenchmarkTable, ColorTier, Transition};
use crate::dataset::Dataset;
use funnel_core::types::{Diagnostics, Event, EventType, Session};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A check a session must pass to reach a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum StagePredicate {
    /// At least one event of this type was recorded for the session.
    HadEvent(EventType),
    /// The session has `started_at`.
    Started,
    /// The session has `completed_at`.
    Completed,
    /// The session has a `submission_id`.
    Submitted,
    /// The session carries a non-blank email.
    HasEmail,
    /// Progress reached at least this question index.
    ReachedQuestion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub label: String,
    pub predicate: StagePredicate,
    /// Benchmark key for the transition into this stage.
    #[serde(default)]
    pub benchmark: Option<String>,
}

impl StageDefinition {
    pub fn new(label: impl Into<String>, predicate: StagePredicate) -> Self {
        Self {
            label: label.into(),
            predicate,
            benchmark: None,
        }
    }

    pub fn benchmarked(mut self, transition: Transition) -> Self {
        self.benchmark = Some(transition.key().to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl FunnelDefinition {
    /// Visited → Started Quiz → Completed Quiz → Captured Email.
    pub fn quiz() -> Self {
        Self {
            name: "Quiz Funnel".to_string(),
            stages: vec![
                StageDefinition::new("Visited", StagePredicate::HadEvent(EventType::PageView)),
                StageDefinition::new("Started Quiz", StagePredicate::Started)
                    .benchmarked(Transition::StartRate),
                StageDefinition::new("Completed Quiz", StagePredicate::Completed)
                    .benchmarked(Transition::CompletionRate),
                StageDefinition::new("Captured Email", StagePredicate::Submitted)
                    .benchmarked(Transition::CaptureRate),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub label: String,
    pub count: u64,
    /// Share of stage 0, in percent.
    pub percentage: f64,
    /// Share of the previous stage, in percent.
    pub step_rate: f64,
    pub color_tier: ColorTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropOff {
    pub from_index: usize,
    pub from_label: String,
    pub to_label: String,
    pub lost: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelReport {
    pub name: String,
    pub steps: Vec<FunnelStep>,
    pub drop_offs: Vec<DropOff>,
    pub overall_conversion_pct: f64,
    pub diagnostics: Diagnostics,
}

/// Per-session facts the predicates are evaluated against.
#[derive(Default)]
struct SessionFacts<'a> {
    session: Option<&'a Session>,
    event_types: HashSet<EventType>,
    max_question: Option<u32>,
}

impl SessionFacts<'_> {
    fn satisfies(&self, predicate: &StagePredicate) -> bool {
        match predicate {
            StagePredicate::HadEvent(t) => self.event_types.contains(t),
            StagePredicate::Started => self.session.is_some_and(|s| s.started_at.is_some()),
            StagePredicate::Completed => self.session.is_some_and(|s| s.completed_at.is_some()),
            StagePredicate::Submitted => self.session.is_some_and(|s| s.submission_id.is_some()),
            StagePredicate::HasEmail => {
                self.session.is_some_and(|s| s.normalized_email().is_some())
            }
            StagePredicate::ReachedQuestion(n) => self.max_question.is_some_and(|q| q >= *n),
        }
    }
}

fn collect_facts<'a>(events: &'a [Event], sessions: &'a [Session]) -> BTreeMap<&'a str, SessionFacts<'a>> {
    let mut facts: BTreeMap<&str, SessionFacts> = BTreeMap::new();
    for session in sessions {
        let entry = facts.entry(session.session_id.as_str()).or_default();
        entry.session = Some(session);
        entry.max_question = session.last_question_index;
    }
    for event in events {
        let entry = facts.entry(event.session_id.as_str()).or_default();
        entry.event_types.insert(event.event_type);
        if let Some(index) = event.question_index {
            entry.max_question = Some(entry.max_question.map_or(index, |q| q.max(index)));
        }
    }
    facts
}

pub struct FunnelAggregator {
    benchmarks: BenchmarkTable,
}

impl FunnelAggregator {
    pub fn new(benchmarks: BenchmarkTable) -> Self {
        Self { benchmarks }
    }

    pub fn benchmarks(&self) -> &BenchmarkTable {
        &self.benchmarks
    }

    /// Count sessions reaching each stage. A session is counted at stage i only
    /// if it also satisfied every stage before i.
    pub fn aggregate(&self, definition: &FunnelDefinition, data: &Dataset) -> FunnelReport {
        let facts = collect_facts(data.events(), data.sessions());

        let mut survivors: Vec<&SessionFacts> = facts.values().collect();
        let mut counts = Vec::with_capacity(definition.stages.len());
        for stage in &definition.stages {
            survivors.retain(|f| f.satisfies(&stage.predicate));
            counts.push(survivors.len() as u64);
        }

        let mut report = self.report_from_counts(definition, &counts);
        report.diagnostics = data.diagnostics();
        metrics::counter!("funnel.aggregations").increment(1);
        report
    }

    /// Build a report from raw stage counts. Counts are clamped to be
    /// non-increasing.
    pub fn report_from_counts(&self, definition: &FunnelDefinition, counts: &[u64]) -> FunnelReport {
        let steps = self.steps_from_counts(definition, counts);
        let drop_offs = drop_offs(&steps);
        let overall_conversion_pct = steps.last().map_or(0.0, |s| {
            if steps.len() > 1 {
                s.percentage
            } else {
                0.0
            }
        });
        FunnelReport {
            name: definition.name.clone(),
            steps,
            drop_offs,
            overall_conversion_pct,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn steps_from_counts(&self, definition: &FunnelDefinition, counts: &[u64]) -> Vec<FunnelStep> {
        let mut steps: Vec<FunnelStep> = Vec::with_capacity(definition.stages.len());
        let top = counts.first().copied().unwrap_or(0);

        for (i, stage) in definition.stages.iter().enumerate() {
            let raw = counts.get(i).copied().unwrap_or(0);
            let count = match steps.last() {
                Some(prev) => raw.min(prev.count),
                None => raw,
            };

            let (percentage, step_rate, color_tier) = match steps.last() {
                None => (100.0, 100.0, ColorTier::Success),
                Some(prev) => {
                    let rate = ratio_pct(count, prev.count);
                    (
                        ratio_pct(count, top),
                        rate,
                        self.benchmarks.classify(stage.benchmark.as_deref(), rate),
                    )
                }
            };

            steps.push(FunnelStep {
                label: stage.label.clone(),
                count,
                percentage,
                step_rate,
                color_tier,
            });
        }
        steps
    }
}

impl Default for FunnelAggregator {
    fn default() -> Self {
        Self::new(BenchmarkTable::default())
    }
}

/// `part / whole * 100`, clamped to 0..=100; 0 when `whole` is 0.
pub fn ratio_pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
}

/// Drop-off between each adjacent pair: `(c_i - c_{i+1}) / c_i * 100`.
pub fn drop_offs(steps: &[FunnelStep]) -> Vec<DropOff> {
    steps
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let lost = pair[0].count.saturating_sub(pair[1].count);
            DropOff {
                from_index: i,
                from_label: pair[0].label.clone(),
                to_label: pair[1].label.clone(),
                lost,
                percentage: ratio_pct(lost, pair[0].count),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use funnel_core::types::pages;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    /// Builds a visitor who reaches `depth` stages of the quiz funnel.
    fn visitor(id: &str, depth: usize) -> (Vec<Event>, Session) {
        let now = t0();
        let mut session = Session::new(id, pages::QUIZ, now);
        let mut events = vec![Event::new(id, EventType::PageView, now)];
        if depth >= 2 {
            session.started_at = Some(now + Duration::seconds(5));
            events.push(Event::new(id, EventType::QuizStart, now + Duration::seconds(5)));
        }
        if depth >= 3 {
            session.completed_at = Some(now + Duration::minutes(3));
            session.is_completed = true;
        }
        if depth >= 4 {
            session.submission_id = Some(format!("sub-{id}"));
            session.email = Some(format!("{id}@example.com"));
        }
        (events, session)
    }

    fn dataset(depths: &[usize]) -> Dataset {
        let mut events = Vec::new();
        let mut sessions = Vec::new();
        for (i, depth) in depths.iter().enumerate() {
            let (e, s) = visitor(&format!("s{i}"), *depth);
            events.extend(e);
            sessions.push(s);
        }
        Dataset::new(events, sessions)
    }

    #[test]
    fn test_quiz_funnel_counts_and_percentages() {
        // 4 visitors, 3 start, 2 complete, 1 captures.
        let data = dataset(&[4, 3, 2, 1]);
        let report = FunnelAggregator::default().aggregate(&FunnelDefinition::quiz(), &data);

        let counts: Vec<u64> = report.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![4, 3, 2, 1]);
        assert_eq!(report.steps[0].percentage, 100.0);
        assert_eq!(report.steps[1].percentage, 75.0);
        assert_eq!(report.steps[3].percentage, 25.0);
        assert_eq!(report.overall_conversion_pct, 25.0);

        // 2/3 completion is below the 70% good threshold but above 50%.
        assert_eq!(report.steps[2].color_tier, ColorTier::Warning);
        // 1/2 capture is below the 70% warning threshold.
        assert_eq!(report.steps[3].color_tier, ColorTier::Error);
    }

    #[test]
    fn test_completion_without_start_is_not_counted() {
        let (events, mut session) = visitor("ghost", 1);
        session.completed_at = Some(t0() + Duration::minutes(1));
        session.submission_id = Some("sub".into());
        let data = Dataset::new(events, vec![session]);

        let report = FunnelAggregator::default().aggregate(&FunnelDefinition::quiz(), &data);
        let counts: Vec<u64> = report.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_counts_are_monotonic_and_percentages_bounded() {
        let data = dataset(&[1, 4, 2, 2, 3, 4, 1, 1, 3]);
        let report = FunnelAggregator::default().aggregate(&FunnelDefinition::quiz(), &data);
        for pair in report.steps.windows(2) {
            assert!(pair[1].count <= pair[0].count);
        }
        for step in &report.steps {
            assert!((0.0..=100.0).contains(&step.percentage));
        }
        assert_eq!(report.steps[0].percentage, 100.0);
    }

    #[test]
    fn test_empty_period_has_no_nan() {
        let report = FunnelAggregator::default().aggregate(&FunnelDefinition::quiz(), &Dataset::default());
        assert_eq!(report.steps[0].percentage, 100.0);
        for step in &report.steps {
            assert!(step.percentage.is_finite());
            assert!(step.step_rate.is_finite());
        }
        for drop in &report.drop_offs {
            assert_eq!(drop.percentage, 0.0);
        }
    }

    #[test]
    fn test_drop_off_uses_previous_stage_as_denominator() {
        let report = FunnelAggregator::default()
            .report_from_counts(&FunnelDefinition::quiz(), &[1000, 350, 200, 150]);
        assert_eq!(report.drop_offs.len(), 3);
        assert_eq!(report.drop_offs[0].lost, 650);
        assert!((report.drop_offs[0].percentage - 65.0).abs() < 1e-9);
        assert!((report.drop_offs[1].percentage - 42.857).abs() < 0.01);
        assert_eq!(report.drop_offs[2].percentage, 25.0);
        // Percentage stays relative to stage 0.
        assert!((report.steps[2].percentage - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_supplied_counts_are_clamped_non_increasing() {
        let steps = FunnelAggregator::default()
            .steps_from_counts(&FunnelDefinition::quiz(), &[10, 20, 5, 8]);
        let counts: Vec<u64> = steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![10, 10, 5, 5]);
    }

    #[test]
    fn test_question_progress_predicate() {
        let (mut events, session) = visitor("s1", 2);
        let mut answer = Event::new("s1", EventType::QuestionAnswer, t0());
        answer.question_index = Some(4);
        events.push(answer);
        let data = Dataset::new(events, vec![session]);

        let definition = FunnelDefinition {
            name: "Depth".into(),
            stages: vec![
                StageDefinition::new("Started", StagePredicate::Started),
                StageDefinition::new("Q3", StagePredicate::ReachedQuestion(3)),
                StageDefinition::new("Q5", StagePredicate::ReachedQuestion(5)),
            ],
        };
        let report = FunnelAggregator::default().aggregate(&definition, &data);
        let counts: Vec<u64> = report.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![1, 1, 0]);
    }

    #[test]
    fn test_email_predicate_ignores_blank_addresses() {
        let (mut events, known) = visitor("s1", 2);
        let (e2, mut blank) = visitor("s2", 2);
        let (e3, mut retargeted) = visitor("s3", 2);
        blank.email = Some("   ".into());
        retargeted.email = Some("Ann@Example.com".into());
        events.extend(e2);
        events.extend(e3);
        let data = Dataset::new(events, vec![known, blank, retargeted]);

        let definition = FunnelDefinition {
            name: "Identified".into(),
            stages: vec![
                StageDefinition::new("Started", StagePredicate::Started),
                StageDefinition::new("Identified", StagePredicate::HasEmail),
            ],
        };
        let report = FunnelAggregator::default().aggregate(&definition, &data);
        let counts: Vec<u64> = report.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![3, 1]);
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let data = dataset(&[4, 3, 3, 2, 1, 1]);
        let aggregator = FunnelAggregator::default();
        let first = aggregator.aggregate(&FunnelDefinition::quiz(), &data);
        let second = aggregator.aggregate(&FunnelDefinition::quiz(), &data);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
