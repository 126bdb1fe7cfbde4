//! Per-question engagement within a period.

use crate::dataset::Dataset;
use crate::funnel::ratio_pct;
use funnel_core::types::{Diagnostics, EventType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionStats {
    pub question_index: u32,
    pub question_id: Option<String>,
    pub views: u64,
    pub answers: u64,
    /// Answers per view, in percent.
    pub answer_rate: f64,
    pub avg_time_spent_ms: f64,
    /// Sessions whose abandonment happened at this question.
    pub abandonments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionReport {
    pub questions: Vec<QuestionStats>,
    pub completed_sessions: u64,
    pub avg_completion_time_ms: f64,
    pub diagnostics: Diagnostics,
}

#[derive(Default)]
struct Acc {
    question_id: Option<String>,
    views: u64,
    answers: u64,
    timed: u64,
    time_total: u64,
    abandonments: u64,
}

pub fn analyze_questions(data: &Dataset) -> QuestionReport {
    let mut per_question: BTreeMap<u32, Acc> = BTreeMap::new();
    let mut abandon_at: HashMap<&str, u32> = HashMap::new();

    for event in data.events() {
        let Some(index) = event.question_index else {
            continue;
        };
        match event.event_type {
            EventType::QuestionView | EventType::QuestionAnswer => {
                let acc = per_question.entry(index).or_default();
                if acc.question_id.is_none() {
                    acc.question_id = event.question_id.clone();
                }
                if event.event_type == EventType::QuestionView {
                    acc.views += 1;
                } else {
                    acc.answers += 1;
                    if let Some(ms) = event.time_spent_ms {
                        acc.timed += 1;
                        acc.time_total = acc.time_total.saturating_add(ms);
                    }
                }
            }
            EventType::QuizAbandon => {
                let at = abandon_at.entry(event.session_id.as_str()).or_insert(index);
                *at = (*at).max(index);
            }
            _ => {}
        }
    }

    let mut completed_sessions = 0u64;
    let mut completion_total = 0u64;
    for session in data.sessions() {
        if session.abandoned_at.is_some() {
            if let Some(index) = session.last_question_index {
                abandon_at.insert(session.session_id.as_str(), index);
            }
        }
        let elapsed = session.completion_time_ms.or_else(|| {
            match (session.started_at, session.completed_at) {
                (Some(start), Some(end)) if end >= start => {
                    u64::try_from((end - start).num_milliseconds()).ok()
                }
                _ => None,
            }
        });
        if session.completed_at.is_some() {
            if let Some(ms) = elapsed {
                completed_sessions += 1;
                completion_total = completion_total.saturating_add(ms);
            }
        }
    }

    for index in abandon_at.into_values() {
        per_question.entry(index).or_default().abandonments += 1;
    }

    let questions = per_question
        .into_iter()
        .map(|(question_index, acc)| QuestionStats {
            question_index,
            question_id: acc.question_id,
            views: acc.views,
            answers: acc.answers,
            answer_rate: ratio_pct(acc.answers, acc.views),
            avg_time_spent_ms: mean(acc.time_total, acc.timed),
            abandonments: acc.abandonments,
        })
        .collect();

    QuestionReport {
        questions,
        completed_sessions,
        avg_completion_time_ms: mean(completion_total, completed_sessions),
        diagnostics: data.diagnostics(),
    }
}

fn mean(total: u64, n: u64) -> f64 {
    if n == 0 {
        0.0
    } else {
        total as f64 / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use funnel_core::types::{pages, Event, Session};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn question(session: &str, kind: EventType, index: u32, spent: Option<u64>) -> Event {
        let mut e = Event::new(session, kind, t0());
        e.question_index = Some(index);
        e.question_id = Some(format!("q{index}"));
        e.time_spent_ms = spent;
        e
    }

    #[test]
    fn test_views_answers_and_timing() {
        let events = vec![
            question("s1", EventType::QuestionView, 0, None),
            question("s1", EventType::QuestionAnswer, 0, Some(4000)),
            question("s2", EventType::QuestionView, 0, None),
            question("s2", EventType::QuestionAnswer, 0, Some(2000)),
            question("s1", EventType::QuestionView, 1, None),
            question("s2", EventType::QuestionView, 1, None),
            question("s1", EventType::QuestionAnswer, 1, None),
        ];
        let report = analyze_questions(&Dataset::new(events, Vec::new()));

        assert_eq!(report.questions.len(), 2);
        let first = &report.questions[0];
        assert_eq!(first.question_id.as_deref(), Some("q0"));
        assert_eq!(first.answer_rate, 100.0);
        assert_eq!(first.avg_time_spent_ms, 3000.0);

        let second = &report.questions[1];
        assert_eq!(second.views, 2);
        assert_eq!(second.answers, 1);
        assert_eq!(second.answer_rate, 50.0);
        assert_eq!(second.avg_time_spent_ms, 0.0);
    }

    #[test]
    fn test_abandonment_counted_once_per_session() {
        let mut abandoned = Session::new("s1", pages::QUIZ, t0());
        abandoned.started_at = Some(t0());
        abandoned.abandoned_at = Some(t0() + Duration::minutes(2));
        abandoned.last_question_index = Some(3);
        let events = vec![
            question("s1", EventType::QuizAbandon, 3, None),
            question("s2", EventType::QuizAbandon, 1, None),
        ];
        let report = analyze_questions(&Dataset::new(events, vec![abandoned]));

        let at = |i: u32| {
            report
                .questions
                .iter()
                .find(|q| q.question_index == i)
                .map_or(0, |q| q.abandonments)
        };
        assert_eq!(at(3), 1);
        assert_eq!(at(1), 1);
    }

    #[test]
    fn test_average_completion_time() {
        let mut fast = Session::new("s1", pages::QUIZ, t0());
        fast.started_at = Some(t0());
        fast.completed_at = Some(t0() + Duration::seconds(60));
        let mut slow = Session::new("s2", pages::QUIZ, t0());
        slow.completed_at = Some(t0() + Duration::seconds(200));
        slow.completion_time_ms = Some(180_000);
        let open = Session::new("s3", pages::QUIZ, t0());

        let report = analyze_questions(&Dataset::new(Vec::new(), vec![fast, slow, open]));
        assert_eq!(report.completed_sessions, 2);
        assert_eq!(report.avg_completion_time_ms, 120_000.0);
    }

    #[test]
    fn test_empty_dataset() {
        let report = analyze_questions(&Dataset::default());
        assert!(report.questions.is_empty());
        assert_eq!(report.avg_completion_time_ms, 0.0);
    }
}
