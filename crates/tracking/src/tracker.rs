use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use funnel_core::types::{normalize_email, pages, DeviceType, Event, EventType, Session};
use funnel_core::{FunnelError, FunnelResult, TrackingSink};
use funnel_integrations::{Notification, NotificationKind, OutboundQueue};

use crate::state_machine::{SessionState, SessionStateMachine};

/// Attribution and device context captured on the first page view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageContext {
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
    /// Known identity, e.g. from a retargeting link.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub scroll_depth: Option<f64>,
}

/// A caller-owned reference to one session and its lifecycle state. Every
/// tracker call takes the handle explicitly; nothing is cached globally.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Session,
    machine: SessionStateMachine,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        let machine = SessionStateMachine::starting_at(SessionState::of(&session));
        Self { session, machine }
    }

    pub fn id(&self) -> &str {
        &self.session.session_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.machine.state
    }
}

/// Records quiz interactions. Every call appends an event and upserts the
/// session; the handle is only updated once both writes succeed.
pub struct QuizTracker<W: TrackingSink + ?Sized> {
    sink: Arc<W>,
    outbound: Option<OutboundQueue>,
}

impl<W: TrackingSink + ?Sized> QuizTracker<W> {
    pub fn new(sink: Arc<W>) -> Self {
        Self {
            sink,
            outbound: None,
        }
    }

    /// Send completion and email-capture milestones through `queue`.
    pub fn with_outbound(mut self, queue: OutboundQueue) -> Self {
        self.outbound = Some(queue);
        self
    }

    /// Open a session on its first page view.
    pub async fn page_view(
        &self,
        session_id: Option<String>,
        source_page: &str,
        context: PageContext,
    ) -> FunnelResult<SessionHandle> {
        let now = Utc::now();
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let page = source_page.trim().to_lowercase();

        // A known id is a repeat view: record it, never reset the stored session.
        if let Some(existing) = self.sink.get_session(&session_id).await? {
            let event = view_event(&session_id, &page, context.scroll_depth, now);
            self.sink.append_event(event).await?;
            debug!(session_id = %session_id, page = %page, "Repeat view on existing session");
            return Ok(SessionHandle::new(existing));
        }

        let mut session = Session::new(session_id, page, now);
        session.utm_source = context.utm_source;
        session.utm_medium = context.utm_medium;
        session.utm_campaign = context.utm_campaign;
        session.device_type = context.device_type;
        session.email = context.email.as_deref().and_then(normalize_email);

        let event = view_event(
            &session.session_id,
            &session.source_page,
            context.scroll_depth,
            now,
        );
        self.persist(&session, event).await?;
        debug!(session_id = %session.session_id, page = %session.source_page, "Session opened");
        Ok(SessionHandle::new(session))
    }

    /// Reattach to a persisted session.
    pub async fn resume(&self, session_id: &str) -> FunnelResult<Option<SessionHandle>> {
        Ok(self
            .sink
            .get_session(session_id)
            .await?
            .map(SessionHandle::new))
    }

    pub async fn start_quiz(&self, handle: &mut SessionHandle, total_questions: u32) -> FunnelResult<()> {
        handle.machine.check(SessionState::Active)?;
        let now = Utc::now();
        let mut next = handle.session.clone();
        next.started_at = Some(now);
        next.total_questions = Some(total_questions);
        next.updated_at = now;

        self.persist(&next, Event::new(&next.session_id, EventType::QuizStart, now))
            .await?;
        handle.machine.transition(SessionState::Active)?;
        handle.session = next;
        Ok(())
    }

    pub async fn view_question(
        &self,
        handle: &mut SessionHandle,
        question_id: &str,
        index: u32,
    ) -> FunnelResult<()> {
        self.question_event(handle, EventType::QuestionView, question_id, index, None)
            .await
    }

    pub async fn answer_question(
        &self,
        handle: &mut SessionHandle,
        question_id: &str,
        index: u32,
        time_spent_ms: u64,
    ) -> FunnelResult<()> {
        self.question_event(
            handle,
            EventType::QuestionAnswer,
            question_id,
            index,
            Some(time_spent_ms),
        )
        .await
    }

    async fn question_event(
        &self,
        handle: &mut SessionHandle,
        kind: EventType,
        question_id: &str,
        index: u32,
        time_spent_ms: Option<u64>,
    ) -> FunnelResult<()> {
        require_active(handle)?;
        if let Some(total) = handle.session.total_questions {
            if index >= total {
                return Err(FunnelError::Validation(format!(
                    "question index {index} out of range for {total} questions"
                )));
            }
        }

        let now = Utc::now();
        let mut next = handle.session.clone();
        next.last_question_index = Some(next.last_question_index.map_or(index, |i| i.max(index)));
        next.updated_at = now;

        let mut event = Event::new(&next.session_id, kind, now);
        event.question_id = Some(question_id.to_string());
        event.question_index = Some(index);
        event.time_spent_ms = time_spent_ms;

        self.persist(&next, event).await?;
        handle.session = next;
        Ok(())
    }

    /// Attach the visitor's email and the stored submission. The email is
    /// immutable once set; repeating the same address is a no-op.
    pub async fn capture_email(
        &self,
        handle: &mut SessionHandle,
        email: &str,
        submission_id: Option<String>,
    ) -> FunnelResult<()> {
        if handle.state() == SessionState::Cleared {
            return Err(FunnelError::InvalidTransition("session already cleared".into()));
        }
        let email = normalize_email(email)
            .ok_or_else(|| FunnelError::Validation("email must not be empty".into()))?;
        match handle.session.normalized_email() {
            Some(existing) if existing == email && handle.session.submission_id.is_some() => {
                return Ok(());
            }
            Some(existing) if existing != email => {
                return Err(FunnelError::Validation(format!(
                    "session {} already belongs to another email",
                    handle.id()
                )));
            }
            _ => {}
        }

        let now = Utc::now();
        let mut next = handle.session.clone();
        next.email = Some(email.clone());
        next.submission_id =
            Some(submission_id.unwrap_or_else(|| Uuid::new_v4().to_string()));
        next.updated_at = now;

        self.sink.upsert_session(next.clone()).await?;
        info!(session_id = %next.session_id, "Email captured");
        self.notify(
            Notification::new(
                NotificationKind::EmailCaptured,
                &next.session_id,
                serde_json::json!({
                    "submission_id": next.submission_id,
                    "source_page": next.source_page,
                    "utm_campaign": next.utm_campaign,
                }),
            )
            .with_email(Some(email)),
        );
        handle.session = next;
        Ok(())
    }

    pub async fn complete(&self, handle: &mut SessionHandle) -> FunnelResult<()> {
        handle.machine.check(SessionState::Completed)?;
        let now = Utc::now();
        let mut next = handle.session.clone();
        next.is_completed = true;
        next.completed_at = Some(now);
        next.completion_time_ms = next
            .started_at
            .and_then(|start| u64::try_from((now - start).num_milliseconds()).ok());
        next.updated_at = now;

        self.persist(&next, Event::new(&next.session_id, EventType::QuizComplete, now))
            .await?;
        handle.machine.transition(SessionState::Completed)?;
        info!(
            session_id = %next.session_id,
            completion_time_ms = next.completion_time_ms,
            "Quiz completed"
        );
        self.notify(
            Notification::new(
                NotificationKind::QuizCompleted,
                &next.session_id,
                serde_json::json!({
                    "completion_time_ms": next.completion_time_ms,
                    "total_questions": next.total_questions,
                }),
            )
            .with_email(next.normalized_email()),
        );
        handle.session = next;
        Ok(())
    }

    /// Abandon the quiz at the furthest question reached.
    pub async fn abandon(&self, handle: &mut SessionHandle) -> FunnelResult<()> {
        handle.machine.check(SessionState::Abandoned)?;
        let now = Utc::now();
        let mut next = handle.session.clone();
        next.abandoned_at = Some(now);
        next.updated_at = now;

        let mut event = Event::new(&next.session_id, EventType::QuizAbandon, now);
        event.question_index = next.last_question_index;

        self.persist(&next, event).await?;
        handle.machine.transition(SessionState::Abandoned)?;
        debug!(session_id = %next.session_id, at_question = ?next.last_question_index, "Quiz abandoned");
        handle.session = next;
        Ok(())
    }

    pub async fn buy_click(&self, handle: &mut SessionHandle) -> FunnelResult<()> {
        if handle.state() == SessionState::Cleared {
            return Err(FunnelError::InvalidTransition("session already cleared".into()));
        }
        let now = Utc::now();
        let mut next = handle.session.clone();
        next.updated_at = now;
        self.persist(&next, Event::new(&next.session_id, EventType::BuyClick, now))
            .await?;
        handle.session = next;
        Ok(())
    }

    /// Release the handle. The persisted session is kept.
    pub fn clear(&self, mut handle: SessionHandle) -> FunnelResult<Session> {
        handle.machine.transition(SessionState::Cleared)?;
        debug!(session_id = %handle.id(), "Session handle cleared");
        Ok(handle.session)
    }

    async fn persist(&self, session: &Session, event: Event) -> FunnelResult<()> {
        self.sink.upsert_session(session.clone()).await?;
        self.sink.append_event(event).await?;
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        if let Some(queue) = &self.outbound {
            queue.enqueue(notification);
        }
    }
}

fn view_event(session_id: &str, page: &str, scroll_depth: Option<f64>, at: DateTime<Utc>) -> Event {
    let kind = if page == pages::PRODUCT {
        EventType::ProductPageView
    } else {
        EventType::PageView
    };
    let mut event = Event::new(session_id, kind, at);
    if let Some(depth) = scroll_depth.filter(|d| d.is_finite()) {
        event
            .metadata
            .insert("scroll_depth".into(), serde_json::json!(depth.clamp(0.0, 100.0)));
    }
    event
}

fn require_active(handle: &SessionHandle) -> FunnelResult<()> {
    if handle.state() == SessionState::Active {
        Ok(())
    } else {
        Err(FunnelError::InvalidTransition(format!(
            "question events need an active quiz, session is {:?}",
            handle.state()
        )))
    }
}
