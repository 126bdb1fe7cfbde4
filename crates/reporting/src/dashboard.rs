//! Dashboard queries: resolves the requested period, reads one snapshot from
//! the store and runs the matching aggregation over it.

use crate::attribution::{AttributionLinker, AttributionReport};
use crate::benchmarks::BenchmarkTable;
use crate::dataset::Dataset;
use crate::funnel::{FunnelAggregator, FunnelDefinition, FunnelReport};
use crate::insights::{Insight, InsightGenerator};
use crate::journey::{JourneyComposer, JourneyReport};
use crate::period::{DateWindow, PeriodResolver};
use crate::questions::{analyze_questions, QuestionReport};
use crate::trend::{compare_funnels, FunnelComparison, PeriodTotals};
use chrono::Duration;
use funnel_core::types::{Order, Period, QueryFilters};
use funnel_core::{AppConfig, FunnelResult, StoreClient};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What the presentation layer asks for: a window, an optional explicit
/// comparison window and dimension filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardQuery {
    #[serde(default)]
    pub window: Option<DateWindow>,
    #[serde(default)]
    pub previous: Option<DateWindow>,
    #[serde(default)]
    pub filters: QueryFilters,
}

impl DashboardQuery {
    pub fn for_window(window: DateWindow) -> Self {
        Self {
            window: Some(window),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightsReport {
    pub period: Period,
    pub funnel: FunnelReport,
    pub insights: Vec<Insight>,
}

pub struct FunnelDashboard {
    store: StoreClient,
    resolver: PeriodResolver,
    definition: FunnelDefinition,
    aggregator: FunnelAggregator,
    insights: InsightGenerator,
    linker: AttributionLinker,
    composer: JourneyComposer,
    lookback: Duration,
    journey_limit: usize,
}

impl FunnelDashboard {
    pub fn new(store: StoreClient, config: &AppConfig) -> FunnelResult<Self> {
        let benchmarks = BenchmarkTable::from_config(&config.benchmarks)?;
        Ok(Self {
            store,
            resolver: PeriodResolver::from_config(&config.reporting),
            definition: FunnelDefinition::quiz(),
            aggregator: FunnelAggregator::new(benchmarks.clone()),
            insights: InsightGenerator::new(benchmarks),
            linker: AttributionLinker::new(),
            composer: JourneyComposer::new(),
            lookback: Duration::days(config.reporting.attribution_lookback_days.max(0)),
            journey_limit: config.reporting.default_journey_limit,
        })
    }

    /// Replace the default quiz funnel.
    pub fn with_definition(mut self, definition: FunnelDefinition) -> Self {
        self.definition = definition;
        self
    }

    pub fn resolver(&self) -> &PeriodResolver {
        &self.resolver
    }

    pub fn definition(&self) -> &FunnelDefinition {
        &self.definition
    }

    pub async fn funnel(&self, query: &DashboardQuery) -> FunnelResult<FunnelReport> {
        let period = self.resolver.resolve(query.window)?;
        let data = self.dataset(&period, &query.filters).await?;
        record_query("funnel");
        Ok(self.aggregator.aggregate(&self.definition, &data))
    }

    pub async fn funnel_comparison(&self, query: &DashboardQuery) -> FunnelResult<FunnelComparison> {
        let periods = self
            .resolver
            .resolve_comparison(query.window, query.previous)?;
        debug!(
            current_start = %periods.current.start,
            previous_start = %periods.previous.start,
            "Comparing periods"
        );

        let (current, previous, current_orders, previous_orders) = tokio::try_join!(
            self.dataset(&periods.current, &query.filters),
            self.dataset(&periods.previous, &query.filters),
            self.store.orders(&periods.current),
            self.store.orders(&periods.previous),
        )?;

        record_query("funnel_comparison");
        Ok(compare_funnels(
            periods,
            self.aggregator.aggregate(&self.definition, &current),
            self.aggregator.aggregate(&self.definition, &previous),
            totals(&current_orders),
            totals(&previous_orders),
        ))
    }

    pub async fn insights(&self, query: &DashboardQuery) -> FunnelResult<InsightsReport> {
        let period = self.resolver.resolve(query.window)?;
        let data = self.dataset(&period, &query.filters).await?;
        let funnel = self.aggregator.aggregate(&self.definition, &data);
        let insights = self.insights.generate(&funnel.steps);
        record_query("insights");
        Ok(InsightsReport {
            period,
            funnel,
            insights,
        })
    }

    /// Orders inside the window, linked against sessions from the lookback
    /// horizon onwards. Session filters are not applied: identity matching
    /// needs every touch the customer had.
    pub async fn attribution(&self, query: &DashboardQuery) -> FunnelResult<AttributionReport> {
        let period = self.resolver.resolve(query.window)?;
        let touches = self.touches(&period);
        let unfiltered = QueryFilters::default();

        let (orders, sessions, events) = tokio::try_join!(
            self.store.orders(&period),
            self.store.sessions(&touches, &unfiltered),
            self.store.events(&touches, &unfiltered),
        )?;

        let report = self.linker.link(&orders, &sessions, &events);
        info!(
            orders = report.total_orders,
            revenue = report.total_revenue,
            ambiguous = report.diagnostics.ambiguous_attributions,
            "Attribution computed"
        );
        record_query("attribution");
        Ok(report)
    }

    pub async fn journeys(
        &self,
        query: &DashboardQuery,
        limit: Option<usize>,
    ) -> FunnelResult<JourneyReport> {
        let period = self.resolver.resolve(query.window)?;
        let touches = self.touches(&period);
        let unfiltered = QueryFilters::default();

        let (orders, touch_sessions, touch_events) = tokio::try_join!(
            self.store.orders(&period),
            self.store.sessions(&touches, &unfiltered),
            self.store.events(&touches, &unfiltered),
        )?;
        // Conversions link over the lookback horizon, same as `attribution`;
        // rows only come from sessions inside the window.
        let attribution = self.linker.link(&orders, &touch_sessions, &touch_events);
        let sessions: Vec<_> = touch_sessions
            .into_iter()
            .filter(|s| period.contains(s.created_at))
            .collect();
        let events: Vec<_> = touch_events
            .into_iter()
            .filter(|e| period.contains(e.created_at))
            .collect();

        let mut submission_ids: Vec<String> = sessions
            .iter()
            .filter_map(|s| s.submission_id.clone())
            .collect();
        submission_ids.sort();
        submission_ids.dedup();
        let submissions = self.store.submissions(&submission_ids).await?;

        record_query("journeys");
        Ok(self.composer.compose(
            &sessions,
            &events,
            &submissions,
            &attribution,
            limit.unwrap_or(self.journey_limit),
        ))
    }

    /// The window stretched back by the attribution lookback.
    fn touches(&self, period: &Period) -> Period {
        Period {
            start: period.start - self.lookback,
            end: period.end,
        }
    }

    pub async fn questions(&self, query: &DashboardQuery) -> FunnelResult<QuestionReport> {
        let period = self.resolver.resolve(query.window)?;
        let data = self.dataset(&period, &query.filters).await?;
        record_query("questions");
        Ok(analyze_questions(&data))
    }

    /// Events and sessions for one period, fetched together so every stage
    /// count comes from the same read.
    async fn dataset(&self, period: &Period, filters: &QueryFilters) -> FunnelResult<Dataset> {
        let (events, sessions) = tokio::try_join!(
            self.store.events(period, filters),
            self.store.sessions(period, filters),
        )?;
        Ok(Dataset::new(events, sessions))
    }
}

fn totals(orders: &[Order]) -> PeriodTotals {
    orders
        .iter()
        .filter(|o| o.is_well_formed())
        .fold(PeriodTotals::default(), |acc, o| PeriodTotals {
            revenue: acc.revenue + o.revenue,
            orders: acc.orders + 1,
        })
}

fn record_query(kind: &'static str) {
    metrics::counter!("funnel.queries", "query" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trend::Direction;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use funnel_core::config::StoreConfig;
    use funnel_core::types::{pages, Event, EventType, Session, Submission};
    use funnel_core::{EventStore, FunnelError, InMemoryStore, TrackingSink};
    use std::sync::Arc;

    fn t(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    async fn visitor(store: &InMemoryStore, id: &str, at: DateTime<Utc>, depth: usize) {
        let mut session = Session::new(id, pages::QUIZ, at);
        store
            .append_event(Event::new(id, EventType::PageView, at))
            .await
            .unwrap();
        if depth >= 2 {
            session.started_at = Some(at);
        }
        if depth >= 3 {
            session.completed_at = Some(at);
        }
        if depth >= 4 {
            session.submission_id = Some(format!("sub-{id}"));
            session.email = Some(format!("{id}@example.com"));
        }
        store.upsert_session(session).await.unwrap();
    }

    fn dashboard(store: Arc<dyn EventStore>) -> FunnelDashboard {
        let config = AppConfig::default();
        FunnelDashboard::new(StoreClient::new(store, &config.store), &config).unwrap()
    }

    fn march(first: u32, last: u32) -> DateWindow {
        DateWindow::new(t(first, 0), t(last, 23))
    }

    #[tokio::test]
    async fn test_funnel_query_reads_only_the_window() {
        let store = Arc::new(InMemoryStore::new());
        visitor(&store, "a", t(10, 9), 4).await;
        visitor(&store, "b", t(10, 10), 2).await;
        visitor(&store, "c", t(25, 10), 4).await;

        let report = dashboard(store)
            .funnel(&DashboardQuery::for_window(march(1, 15)))
            .await
            .unwrap();
        let counts: Vec<u64> = report.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![2, 2, 1, 1]);
    }

    #[tokio::test]
    async fn test_inverted_window_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let query = DashboardQuery::for_window(DateWindow::new(t(20, 0), t(10, 0)));
        let err = dashboard(store).funnel(&query).await.unwrap_err();
        assert!(matches!(err, FunnelError::InvalidRange { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_comparison_uses_previous_equal_length_window() {
        let store = Arc::new(InMemoryStore::new());
        visitor(&store, "old", t(5, 12), 4).await;
        visitor(&store, "new1", t(15, 12), 4).await;
        visitor(&store, "new2", t(16, 12), 1).await;

        let comparison = dashboard(store)
            .funnel_comparison(&DashboardQuery::for_window(march(11, 20)))
            .await
            .unwrap();
        assert_eq!(comparison.current.steps[0].count, 2);
        assert_eq!(comparison.previous.steps[0].count, 1);
        assert_eq!(comparison.stages[0].trend.direction, Direction::Up);
        assert_eq!(comparison.stages[0].trend.value, 100.0);
        assert_eq!(
            comparison.periods.current.length(),
            comparison.periods.previous.length()
        );
    }

    #[tokio::test]
    async fn test_journeys_read_submission_scores() {
        let store = Arc::new(InMemoryStore::new());
        visitor(&store, "a", t(10, 9), 4).await;
        store.insert_submission(Submission {
            submission_id: "sub-a".into(),
            email: None,
            score: Some(7.0),
            created_at: t(10, 9),
        });

        let report = dashboard(store)
            .journeys(&DashboardQuery::for_window(march(1, 15)), Some(10))
            .await
            .unwrap();
        assert_eq!(report.total_users, 1);
        assert_eq!(report.rows[0].quiz_score, Some(7.0));
    }

    struct DownStore;

    #[async_trait]
    impl EventStore for DownStore {
        async fn fetch_events(&self, _: &Period, _: &QueryFilters) -> anyhow::Result<Vec<Event>> {
            anyhow::bail!("store offline")
        }

        async fn fetch_sessions(
            &self,
            _: &Period,
            _: &QueryFilters,
        ) -> anyhow::Result<Vec<Session>> {
            anyhow::bail!("store offline")
        }

        async fn fetch_orders(&self, _: &Period) -> anyhow::Result<Vec<Order>> {
            anyhow::bail!("store offline")
        }

        async fn fetch_submissions(&self, _: &[String]) -> anyhow::Result<Vec<Submission>> {
            anyhow::bail!("store offline")
        }
    }

    #[tokio::test]
    async fn test_journey_conversion_agrees_with_attribution() {
        let store = Arc::new(InMemoryStore::new());
        let february = Utc.with_ymd_and_hms(2024, 2, 25, 9, 0, 0).unwrap();
        let mut earlier = Session::new("s0", pages::PRODUCT, february);
        earlier.email = Some("ann@example.com".into());
        earlier.utm_campaign = Some("winter".into());
        store.upsert_session(earlier).await.unwrap();

        let mut capture = Session::new("s1", pages::QUIZ, t(10, 9));
        capture.email = Some("ann@example.com".into());
        capture.submission_id = Some("sub-1".into());
        store.upsert_session(capture).await.unwrap();

        store.insert_order(Order {
            order_id: "o1".into(),
            email: "ann@example.com".into(),
            revenue: 50.0,
            currency: "USD".into(),
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            created_at: t(5, 12),
        });

        let dashboard = dashboard(store);
        let query = DashboardQuery::for_window(march(1, 31));
        let attribution = dashboard.attribution(&query).await.unwrap();
        assert_eq!(attribution.records[0].matched_session_id.as_deref(), Some("s0"));
        assert_eq!(attribution.records[0].campaign, "winter");

        let journeys = dashboard.journeys(&query, None).await.unwrap();
        assert_eq!(journeys.total_users, 1);
        assert_eq!(journeys.rows[0].capture_session_id, "s1");
        assert!(journeys.rows[0].converted);
        assert_eq!(journeys.completed_journey, 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable_not_zero() {
        let mut config = AppConfig::default();
        config.store = StoreConfig {
            query_timeout_ms: 50,
            max_attempts: 2,
            retry_backoff_ms: 1,
        };
        let dashboard =
            FunnelDashboard::new(StoreClient::new(Arc::new(DownStore), &config.store), &config)
                .unwrap();

        let err = dashboard
            .insights(&DashboardQuery::for_window(march(1, 2)))
            .await
            .unwrap_err();
        assert!(matches!(err, FunnelError::DataUnavailable(_)));
        assert!(err.is_retryable());
    }
}
