use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Campaign label used for orders that cannot be linked to any marketing touch.
pub const NO_CAMPAIGN: &str = "No Campaign";

/// Well-known `source_page` values.
pub mod pages {
    pub const QUIZ: &str = "quiz";
    pub const THANK_YOU: &str = "thank-you";
    pub const PRODUCT: &str = "product";
}

/// Discrete, tracked interaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    QuizStart,
    QuestionView,
    QuestionAnswer,
    QuizComplete,
    QuizAbandon,
    ProductPageView,
    BuyClick,
}

/// An immutable, append-only interaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub question_index: Option<u32>,
    #[serde(default)]
    pub time_spent_ms: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(session_id: impl Into<String>, event_type: EventType, at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            event_type,
            question_id: None,
            question_index: None,
            time_spent_ms: None,
            metadata: serde_json::Map::new(),
            created_at: at,
        }
    }

    /// Scroll depth percentage recorded in `metadata.scroll_depth`, clamped to 0..=100.
    pub fn scroll_depth(&self) -> Option<f64> {
        self.metadata
            .get("scroll_depth")
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 100.0))
    }

    pub fn is_well_formed(&self) -> bool {
        !self.session_id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One visitor's interaction thread, mutated in place by lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub total_questions: Option<u32>,
    #[serde(default)]
    pub last_question_index: Option<u32>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time_ms: Option<u64>,
    #[serde(default)]
    pub submission_id: Option<String>,
    #[serde(default)]
    pub abandoned_at: Option<DateTime<Utc>>,
    pub source_page: String,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        source_page: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            email: None,
            total_questions: None,
            last_question_index: None,
            is_completed: false,
            started_at: None,
            completed_at: None,
            completion_time_ms: None,
            submission_id: None,
            abandoned_at: None,
            source_page: source_page.into(),
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            device_type: DeviceType::Unknown,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().and_then(normalize_email)
    }

    pub fn is_page(&self, page: &str) -> bool {
        self.source_page.eq_ignore_ascii_case(page)
    }

    /// A session is malformed when it has no id, or when it carries both
    /// terminal markers with a progress index past the question count.
    pub fn is_well_formed(&self) -> bool {
        if self.session_id.trim().is_empty() {
            return false;
        }
        if self.completed_at.is_some() && self.abandoned_at.is_some() {
            return match (self.last_question_index, self.total_questions) {
                (Some(last), Some(total)) => last < total,
                (None, _) => true,
                (Some(_), None) => false,
            };
        }
        true
    }
}

/// A purchase record as returned by the order source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub email: String,
    pub revenue: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Order {
    pub fn is_well_formed(&self) -> bool {
        !self.order_id.trim().is_empty() && self.revenue.is_finite() && self.revenue >= 0.0
    }
}

/// A stored quiz submission, linked from a capturing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// A concrete, inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }

    pub fn length(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Optional dimension filters applied to session-scoped queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default)]
    pub source_page: Option<String>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
}

impl QueryFilters {
    pub fn matches(&self, session: &Session) -> bool {
        fn eq(filter: &Option<String>, value: Option<&str>) -> bool {
            match filter {
                Some(f) => value.is_some_and(|v| v.eq_ignore_ascii_case(f)),
                None => true,
            }
        }
        eq(&self.source_page, Some(session.source_page.as_str()))
            && eq(&self.utm_source, session.utm_source.as_deref())
            && eq(&self.utm_campaign, session.utm_campaign.as_deref())
            && self.device_type.map_or(true, |d| d == session.device_type)
    }
}

/// Counters describing records that did not contribute to a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub skipped: u64,
    pub ambiguous_attributions: u64,
}

impl Diagnostics {
    pub fn merge(&mut self, other: Diagnostics) {
        self.skipped += other.skipped;
        self.ambiguous_attributions += other.ambiguous_attributions;
    }
}

/// Case-insensitive, trimmed identity used to join sessions, orders and submissions.
pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email("  Jane.Doe@Example.COM "),
            Some("jane.doe@example.com".to_string())
        );
        assert_eq!(normalize_email("   "), None);
    }

    #[test]
    fn test_session_deserializes_with_defaults() {
        let json = r#"{
            "session_id": "s1",
            "source_page": "quiz",
            "device_type": "smart-fridge",
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T10:00:00Z"
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.device_type, DeviceType::Unknown);
        assert!(!session.is_completed);
        assert!(session.email.is_none());
    }

    #[test]
    fn test_conflicting_terminal_markers_are_malformed() {
        let mut session = Session::new("s1", pages::QUIZ, ts(1));
        session.completed_at = Some(ts(2));
        session.abandoned_at = Some(ts(2));
        session.total_questions = Some(5);
        session.last_question_index = Some(7);
        assert!(!session.is_well_formed());

        session.last_question_index = Some(3);
        assert!(session.is_well_formed());
    }

    #[test]
    fn test_scroll_depth_is_clamped() {
        let mut event = Event::new("s1", EventType::PageView, ts(1));
        event
            .metadata
            .insert("scroll_depth".into(), serde_json::json!(140));
        assert_eq!(event.scroll_depth(), Some(100.0));
    }

    #[test]
    fn test_filters_match_case_insensitively() {
        let mut session = Session::new("s1", pages::QUIZ, ts(1));
        session.utm_source = Some("Facebook".into());
        let filters = QueryFilters {
            utm_source: Some("facebook".into()),
            ..Default::default()
        };
        assert!(filters.matches(&session));

        let filters = QueryFilters {
            utm_campaign: Some("spring".into()),
            ..Default::default()
        };
        assert!(!filters.matches(&session));
    }

    #[test]
    fn test_order_with_negative_revenue_is_malformed() {
        let order = Order {
            order_id: "o1".into(),
            email: "a@b.c".into(),
            revenue: -5.0,
            currency: "USD".into(),
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            created_at: ts(3),
        };
        assert!(!order.is_well_formed());
    }
}
