//! Per-user journey rows: capture → thank-you page → retargeted product visit
//! → conversion.

use crate::attribution::AttributionReport;
use chrono::{DateTime, Utc};
use funnel_core::types::{normalize_email, pages, Event, EventType, Session, Submission};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const DEFAULT_JOURNEY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJourney {
    pub email: String,
    pub captured_at: DateTime<Utc>,
    pub capture_session_id: String,
    pub capture_campaign: Option<String>,
    pub quiz_score: Option<f64>,
    pub thank_you_scroll_pct: f64,
    pub thank_you_clicked: bool,
    /// Set only when a product-page session follows the capture.
    pub retargeting_campaign: Option<String>,
    pub product_scroll_pct: Option<f64>,
    pub product_clicked: Option<bool>,
    /// The user has at least one order linked to one of their sessions.
    pub converted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyReport {
    pub total_users: u64,
    pub completed_journey: u64,
    pub rows: Vec<UserJourney>,
}

/// Page-level engagement read from a session's events.
#[derive(Debug, Default, Clone, Copy)]
struct Engagement {
    scroll_pct: f64,
    clicked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct JourneyComposer;

impl JourneyComposer {
    pub fn new() -> Self {
        Self
    }

    pub fn compose(
        &self,
        sessions: &[Session],
        events: &[Event],
        submissions: &[Submission],
        attribution: &AttributionReport,
        limit: usize,
    ) -> JourneyReport {
        let submissions: HashMap<&str, &Submission> = submissions
            .iter()
            .map(|s| (s.submission_id.as_str(), s))
            .collect();

        let mut engagement: HashMap<&str, Engagement> = HashMap::new();
        for event in events {
            let entry = engagement.entry(event.session_id.as_str()).or_default();
            if let Some(depth) = event.scroll_depth() {
                entry.scroll_pct = entry.scroll_pct.max(depth);
            }
            if event.event_type == EventType::BuyClick {
                entry.clicked = true;
            }
        }

        // Resolve each session to an identity; capture sessions may only carry
        // the email on their submission.
        let mut by_email: BTreeMap<String, Vec<&Session>> = BTreeMap::new();
        for session in sessions.iter().filter(|s| s.is_well_formed()) {
            let email = session.normalized_email().or_else(|| {
                session
                    .submission_id
                    .as_deref()
                    .and_then(|id| submissions.get(id))
                    .and_then(|sub| sub.email.as_deref())
                    .and_then(normalize_email)
            });
            if let Some(email) = email {
                by_email.entry(email).or_default().push(session);
            }
        }

        let converted: HashSet<String> = attribution
            .records
            .iter()
            .filter(|r| r.matched_session_id.is_some())
            .filter_map(|r| normalize_email(&r.email))
            .collect();

        let mut rows: Vec<UserJourney> = Vec::new();
        for (email, mut history) in by_email {
            history.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            });

            let Some(capture) = history.iter().rev().find(|s| s.submission_id.is_some()).copied()
            else {
                continue;
            };
            let engaged = |s: &Session| {
                engagement
                    .get(s.session_id.as_str())
                    .copied()
                    .unwrap_or_default()
            };

            let thank_you = history
                .iter()
                .rev()
                .find(|s| s.is_page(pages::THANK_YOU))
                .copied()
                .map(|s| engaged(s))
                .unwrap_or_default();
            let product = history
                .iter()
                .rev()
                .find(|s| s.is_page(pages::PRODUCT) && s.created_at > capture.created_at)
                .copied();

            let quiz_score = capture
                .submission_id
                .as_deref()
                .and_then(|id| submissions.get(id))
                .and_then(|sub| sub.score)
                .filter(|score| score.is_finite());

            rows.push(UserJourney {
                converted: converted.contains(&email),
                email,
                captured_at: capture.created_at,
                capture_session_id: capture.session_id.clone(),
                capture_campaign: capture.utm_campaign.clone(),
                quiz_score,
                thank_you_scroll_pct: thank_you.scroll_pct,
                thank_you_clicked: thank_you.clicked,
                retargeting_campaign: product.and_then(|p| p.utm_campaign.clone()),
                product_scroll_pct: product.map(|p| engaged(p).scroll_pct),
                product_clicked: product.map(|p| engaged(p).clicked),
            });
        }

        let total_users = rows.len() as u64;
        let completed_journey = rows.iter().filter(|r| r.converted).count() as u64;

        rows.sort_by(|a, b| {
            b.captured_at
                .cmp(&a.captured_at)
                .then_with(|| a.email.cmp(&b.email))
        });
        rows.truncate(limit);

        JourneyReport {
            total_users,
            completed_journey,
            rows,
        }
    }
}
