//! Funnel Insights: quiz funnel, attribution and journey analytics.
//!
//! `serve` runs the HTTP API over a store snapshot; `report` prints a single
//! report as JSON and exits.

use clap::{Parser, Subcommand, ValueEnum};
use funnel_api::rest::ReportParams;
use funnel_api::{ApiServer, AppState};
use funnel_core::config::AppConfig;
use funnel_core::{InMemoryStore, StoreClient, TrackingSink};
use funnel_integrations::OutboundQueue;
use funnel_reporting::FunnelDashboard;
use funnel_tracking::QuizTracker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "funnel-insights")]
#[command(about = "Quiz funnel, attribution and journey analytics")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML/YAML/JSON, extension optional)
    #[arg(long, env = "FUNNEL_INSIGHTS_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "FUNNEL_INSIGHTS__NODE_ID")]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the dashboard and tracking API.
    Serve {
        /// JSON snapshot to preload; starts empty when omitted
        #[arg(long)]
        data: Option<PathBuf>,

        /// HTTP port (overrides config)
        #[arg(long, env = "FUNNEL_INSIGHTS__API__HTTP_PORT")]
        http_port: Option<u16>,
    },
    /// Print one report over a snapshot as JSON.
    Report {
        #[arg(value_enum)]
        kind: ReportKind,

        #[arg(long)]
        data: PathBuf,

        /// Window start, `YYYY-MM-DD` or RFC 3339
        #[arg(long)]
        start: Option<String>,

        /// Window end, `YYYY-MM-DD` (inclusive) or RFC 3339
        #[arg(long)]
        end: Option<String>,

        /// Comparison window start, used by `compare`
        #[arg(long)]
        previous_start: Option<String>,

        #[arg(long)]
        previous_end: Option<String>,

        #[arg(long)]
        source_page: Option<String>,

        #[arg(long)]
        utm_source: Option<String>,

        #[arg(long)]
        utm_campaign: Option<String>,

        /// Row limit for `journeys`
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ReportKind {
    Funnel,
    Compare,
    Insights,
    Attribution,
    Journeys,
    Questions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnel_insights=info,funnel_api=info,tower_http=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }

    match cli.command {
        Command::Serve { data, http_port } => {
            if let Some(port) = http_port {
                config.api.http_port = port;
            }
            serve(config, data).await
        }
        Command::Report {
            kind,
            data,
            start,
            end,
            previous_start,
            previous_end,
            source_page,
            utm_source,
            utm_campaign,
            limit,
        } => {
            let params = ReportParams {
                start_date: start,
                end_date: end,
                previous_start_date: previous_start,
                previous_end_date: previous_end,
                source_page,
                utm_source,
                utm_campaign,
                limit,
                ..Default::default()
            };
            report(config, kind, data, params).await
        }
    }
}

async fn serve(config: AppConfig, data: Option<PathBuf>) -> anyhow::Result<()> {
    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        "Funnel Insights starting up"
    );

    let store = Arc::new(match data {
        Some(path) => InMemoryStore::load(path)?,
        None => InMemoryStore::new(),
    });

    let dashboard = FunnelDashboard::new(StoreClient::new(store.clone(), &config.store), &config)?;

    let (outbound, _delivery) = OutboundQueue::from_config(&config.notifications)?;
    let sink: Arc<dyn TrackingSink> = store;
    let tracker = QuizTracker::new(sink).with_outbound(outbound.clone());

    let state = AppState::new(dashboard, tracker, Some(outbound), config.node_id.clone());
    let api_server = ApiServer::new(config, state);

    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Funnel Insights is ready to serve traffic");
    api_server.start_http().await
}

async fn report(
    config: AppConfig,
    kind: ReportKind,
    data: PathBuf,
    params: ReportParams,
) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::load(data)?);
    let dashboard = FunnelDashboard::new(StoreClient::new(store, &config.store), &config)?;
    let query = params.to_query()?;

    let output = match kind {
        ReportKind::Funnel => serde_json::to_string_pretty(&dashboard.funnel(&query).await?)?,
        ReportKind::Compare => {
            serde_json::to_string_pretty(&dashboard.funnel_comparison(&query).await?)?
        }
        ReportKind::Insights => serde_json::to_string_pretty(&dashboard.insights(&query).await?)?,
        ReportKind::Attribution => {
            serde_json::to_string_pretty(&dashboard.attribution(&query).await?)?
        }
        ReportKind::Journeys => {
            serde_json::to_string_pretty(&dashboard.journeys(&query, params.limit).await?)?
        }
        ReportKind::Questions => {
            serde_json::to_string_pretty(&dashboard.questions(&query).await?)?
        }
    };
    println!("{output}");
    Ok(())
}
