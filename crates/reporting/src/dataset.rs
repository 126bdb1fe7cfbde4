//! One consistent read of events and sessions for a period. Every aggregation
//! of a single query runs over the same `Dataset`.

use funnel_core::types::{Diagnostics, Event, Session};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    events: Vec<Event>,
    sessions: Vec<Session>,
    diagnostics: Diagnostics,
}

impl Dataset {
    /// Drop malformed rows (counted in `diagnostics.skipped`) and keep the most
    /// recently updated copy of each session.
    pub fn new(events: Vec<Event>, sessions: Vec<Session>) -> Self {
        let mut diagnostics = Diagnostics::default();

        let total_events = events.len();
        let events: Vec<Event> = events.into_iter().filter(Event::is_well_formed).collect();
        diagnostics.skipped += (total_events - events.len()) as u64;

        let mut latest: BTreeMap<String, Session> = BTreeMap::new();
        for session in sessions {
            if !session.is_well_formed() {
                diagnostics.skipped += 1;
                continue;
            }
            match latest.get(&session.session_id) {
                Some(existing) if existing.updated_at >= session.updated_at => {}
                _ => {
                    latest.insert(session.session_id.clone(), session);
                }
            }
        }

        if diagnostics.skipped > 0 {
            debug!(skipped = diagnostics.skipped, "Skipped malformed rows");
        }

        Self {
            events,
            sessions: latest.into_values().collect(),
            diagnostics,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Sessions ordered by id.
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn events_by_session(&self) -> HashMap<&str, Vec<&Event>> {
        let mut map: HashMap<&str, Vec<&Event>> = HashMap::new();
        for event in &self.events {
            map.entry(event.session_id.as_str()).or_default().push(event);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use funnel_core::types::{pages, EventType};

    #[test]
    fn test_malformed_rows_are_skipped_and_counted() {
        let now = Utc::now();
        let events = vec![
            Event::new("s1", EventType::PageView, now),
            Event::new("  ", EventType::PageView, now),
        ];
        let sessions = vec![Session::new("", pages::QUIZ, now), Session::new("s1", pages::QUIZ, now)];
        let data = Dataset::new(events, sessions);
        assert_eq!(data.events().len(), 1);
        assert_eq!(data.sessions().len(), 1);
        assert_eq!(data.diagnostics().skipped, 2);
    }

    #[test]
    fn test_duplicate_sessions_keep_latest_update() {
        let now = Utc::now();
        let old = Session::new("s1", pages::QUIZ, now);
        let mut newer = old.clone();
        newer.updated_at = now + Duration::minutes(5);
        newer.started_at = Some(now);
        let data = Dataset::new(Vec::new(), vec![newer, old]);
        assert_eq!(data.sessions().len(), 1);
        assert!(data.sessions()[0].started_at.is_some());
    }
}
