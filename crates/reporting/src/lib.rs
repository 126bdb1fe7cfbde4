//! Funnel analytics and reporting: stage funnels, benchmark insights,
//! period-over-period trends, revenue attribution and user journeys.

pub mod attribution;
pub mod benchmarks;
pub mod dashboard;
pub mod dataset;
pub mod funnel;
pub mod insights;
pub mod journey;
pub mod period;
pub mod questions;
pub mod trend;
pub mod window;

pub use attribution::{AttributionLinker, AttributionRecord, AttributionReport, CampaignSummary};
pub use benchmarks::{BenchmarkTable, ColorTier, Transition};
pub use dashboard::{DashboardQuery, FunnelDashboard, InsightsReport};
pub use dataset::Dataset;
pub use funnel::{FunnelAggregator, FunnelDefinition, FunnelReport, FunnelStep};
pub use insights::{Insight, InsightGenerator, Severity};
pub use journey::{JourneyComposer, JourneyReport, UserJourney};
pub use period::{ComparisonPeriods, DateWindow, PeriodResolver};
pub use questions::{analyze_questions, QuestionReport, QuestionStats};
pub use trend::{trend, Direction, FunnelComparison, Trend};
pub use window::{WindowScope, WindowTicket};
