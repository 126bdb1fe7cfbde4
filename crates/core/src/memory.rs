//! In-process event/session store, loadable from a JSON snapshot.

use crate::store::{EventStore, TrackingSink};
use crate::types::{Event, Order, Period, QueryFilters, Session, Submission};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Serialized contents of a store, as exported by the event-persistence layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub submissions: Vec<Submission>,
}

#[derive(Default)]
pub struct InMemoryStore {
    events: RwLock<Vec<Event>>,
    sessions: DashMap<String, Session>,
    orders: RwLock<Vec<Order>>,
    submissions: DashMap<String, Submission>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        store.events.write().extend(snapshot.events);
        for session in snapshot.sessions {
            store.sessions.insert(session.session_id.clone(), session);
        }
        store.orders.write().extend(snapshot.orders);
        for submission in snapshot.submissions {
            store
                .submissions
                .insert(submission.submission_id.clone(), submission);
        }
        store
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        info!(
            path = %path.display(),
            events = snapshot.events.len(),
            sessions = snapshot.sessions.len(),
            orders = snapshot.orders.len(),
            "Loaded store snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn insert_order(&self, order: Order) {
        self.orders.write().push(order);
    }

    pub fn insert_submission(&self, submission: Submission) {
        self.submissions
            .insert(submission.submission_id.clone(), submission);
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    fn session_passes(&self, session_id: &str, filters: &QueryFilters) -> bool {
        if *filters == QueryFilters::default() {
            return true;
        }
        self.sessions
            .get(session_id)
            .is_some_and(|s| filters.matches(s.value()))
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn fetch_events(
        &self,
        period: &Period,
        filters: &QueryFilters,
    ) -> anyhow::Result<Vec<Event>> {
        let mut rows: Vec<Event> = self
            .events
            .read()
            .iter()
            .filter(|e| period.contains(e.created_at))
            .filter(|e| self.session_passes(&e.session_id, filters))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(rows)
    }

    async fn fetch_sessions(
        &self,
        period: &Period,
        filters: &QueryFilters,
    ) -> anyhow::Result<Vec<Session>> {
        let mut rows: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| period.contains(s.created_at) && filters.matches(s.value()))
            .map(|s| s.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(rows)
    }

    async fn fetch_orders(&self, period: &Period) -> anyhow::Result<Vec<Order>> {
        let mut rows: Vec<Order> = self
            .orders
            .read()
            .iter()
            .filter(|o| period.contains(o.created_at))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        Ok(rows)
    }

    async fn fetch_submissions(&self, ids: &[String]) -> anyhow::Result<Vec<Submission>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.submissions.get(id).map(|s| s.clone()))
            .collect())
    }
}

#[async_trait]
impl TrackingSink for InMemoryStore {
    async fn append_event(&self, event: Event) -> anyhow::Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn upsert_session(&self, session: Session) -> anyhow::Result<()> {
        self.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.session(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{pages, EventType};
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn test_fetch_respects_period_and_filters() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let store = InMemoryStore::new();

        let mut quiz = Session::new("s1", pages::QUIZ, t0);
        quiz.utm_campaign = Some("spring".into());
        store.upsert_session(quiz).await.unwrap();
        store
            .upsert_session(Session::new("s2", pages::PRODUCT, t0 + Duration::days(5)))
            .await
            .unwrap();
        store
            .append_event(Event::new("s1", EventType::PageView, t0))
            .await
            .unwrap();
        store
            .append_event(Event::new("s2", EventType::PageView, t0 + Duration::days(5)))
            .await
            .unwrap();

        let period = Period {
            start: t0,
            end: t0 + Duration::days(1),
        };
        let sessions = store
            .fetch_sessions(&period, &QueryFilters::default())
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);

        let filters = QueryFilters {
            utm_campaign: Some("spring".into()),
            ..Default::default()
        };
        let wide = Period {
            start: t0,
            end: t0 + Duration::days(10),
        };
        let events = store.fetch_events(&wide, &filters).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, "s1");
    }

    #[test]
    fn test_snapshot_parses_minimal_document() {
        let json = r#"{
            "sessions": [{
                "session_id": "s1",
                "source_page": "quiz",
                "created_at": "2024-03-01T10:00:00Z",
                "updated_at": "2024-03-01T10:00:00Z"
            }],
            "orders": [{
                "order_id": "o1",
                "email": "x@y.z",
                "revenue": 49.0,
                "created_at": "2024-03-02T10:00:00Z"
            }]
        }"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();
        let store = InMemoryStore::from_snapshot(snapshot);
        assert!(store.session("s1").is_some());
        assert_eq!(store.orders.read()[0].currency, "USD");
        assert_eq!(store.event_count(), 0);
    }
}
