// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Runlens Server
//!
//! HTTP API over the run store, plus the batch jobs the CLI exposes.

pub mod api;
pub mod config;
pub mod ingestion;
pub mod jobs;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use http::HeaderValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use runlens_core::ModelPricingRegistry;
use runlens_evals::{
    CheckEngine, EvalConfig, EvaluatorRegistry, EvaluatorRunner, LLMClient, OpenAIClient,
};
use runlens_query::{BackfillReport, CostBackfill};
use runlens_storage::Storage;

use api::AppState;
use config::ServerConfig;
use jobs::{RadarJob, RadarReport};

pub const DEFAULT_LOG_FILTER: &str = "runlens_server=info,runlens_query=info,tower_http=info";

/// Install the global tracing subscriber.
pub fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Pricing registry with persisted model mappings and the optional
/// custom pricing file applied.
pub async fn load_pricing(storage: &Storage, config: &ServerConfig) -> Result<ModelPricingRegistry> {
    let pricing = ModelPricingRegistry::new();
    pricing.set_mappings(storage.mappings().list().await?);
    tracing::info!("Loaded {} model mappings", pricing.mapping_count());

    if let Some(path) = &config.storage.pricing_file {
        let count = pricing
            .load_custom_overrides(path)
            .with_context(|| format!("loading pricing file {:?}", path))?;
        tracing::info!("Loaded {} custom prices from {:?}", count, path);
    }
    Ok(pricing)
}

/// Check engine with every built-in evaluator. LLM-judged checks get a
/// client only when an API key is configured.
pub fn build_check_engine(config: &ServerConfig) -> Arc<CheckEngine> {
    let llm_client: Option<Arc<dyn LLMClient>> = match &config.llm.openai_api_key {
        Some(key) => {
            let mut client =
                OpenAIClient::new(key.clone(), config.llm.model_or_default().to_string());
            if let Some(base_url) = &config.llm.base_url {
                client = client.with_base_url(base_url.clone());
            }
            tracing::info!("LLM judge enabled with model {}", config.llm.model_or_default());
            Some(Arc::new(client))
        }
        None => {
            tracing::warn!("No OpenAI API key configured, LLM-judged checks will fail");
            None
        }
    };

    let registry = Arc::new(EvaluatorRegistry::with_defaults(llm_client));
    let runner = Arc::new(EvaluatorRunner::new(registry, EvalConfig::default()));
    Arc::new(CheckEngine::new(runner))
}

pub async fn build_state(config: &ServerConfig) -> Result<AppState> {
    let storage = Storage::connect(&config.storage.database_url).await?;
    let pricing = load_pricing(&storage, config).await?;
    Ok(AppState::new(storage, pricing, build_check_engine(config)))
}

pub fn radar_job(state: &AppState, config: &ServerConfig) -> RadarJob {
    RadarJob::new(state.storage.radars(), state.checks.clone())
        .with_batch_size(config.jobs.radar_batch_size)
        .with_parallelism(config.jobs.radar_parallelism)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.server.cors_origins.is_empty() {
        tracing::warn!("CORS: Allowing all origins. Set cors_origins in production!");
        cors.allow_origin(Any)
    } else {
        tracing::info!("CORS: Allowing origins: {:?}", config.server.cors_origins);
        let origins: Vec<HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("CORS: Ignoring invalid origin {}", origin);
                    None
                }
            })
            .collect();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// The full HTTP API.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/v1/runs/ingest", post(api::ingest_events))
        // Legacy SDK report endpoint
        .route("/api/report", post(api::ingest_events))
        .route("/v1/runs/:run_id/related", get(api::get_related_runs))
        .route("/v1/runs/:run_id/messages", get(api::get_run_messages))
        .route("/v1/runs/:run_id/evaluate", post(api::evaluate_run))
        .route(
            "/v1/template_versions/latest",
            get(api::get_latest_template_version),
        )
        .route("/v1/usage", post(api::get_daily_usage))
        .route("/v1/projects", post(api::create_project))
        .route("/v1/projects/:project_id/usage", get(api::get_project_usage))
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )));

    let app = if config.server.enable_cors {
        app.layer(cors_layer(config))
    } else {
        app
    };
    app.layer(TraceLayer::new_for_http())
}

fn spawn_radar_loop(job: RadarJob, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = job.run_once(None).await {
                tracing::error!("Radar pass failed: {}", e);
            }
        }
    })
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    tracing::info!("Starting Runlens Server");

    let state = build_state(&config).await?;

    let radar_handle = if config.jobs.radar_interval_secs > 0 {
        let job = radar_job(&state, &config);
        Some(spawn_radar_loop(
            job,
            Duration::from_secs(config.jobs.radar_interval_secs),
        ))
    } else {
        tracing::info!("Radar loop disabled");
        None
    };

    let addr = config.socket_addr()?;
    let app = router(state, &config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    if let Some(handle) = radar_handle {
        handle.abort();
    }
    tracing::info!("HTTP server stopped");
    Ok(())
}

/// One cost backfill pass over the configured database.
pub async fn run_backfill(config: &ServerConfig) -> Result<BackfillReport> {
    let storage = Storage::connect(&config.storage.database_url).await?;
    let pricing = load_pricing(&storage, config).await?;
    let report = CostBackfill::new(storage.runs(), pricing)
        .with_batch_size(config.jobs.backfill_batch_size)?
        .run()
        .await?;
    Ok(report)
}

/// One radar pass over the configured database.
pub async fn run_radar(config: &ServerConfig, project_id: Option<Uuid>) -> Result<RadarReport> {
    let state = build_state(config).await?;
    let report = radar_job(&state, config).run_once(project_id).await?;
    Ok(report)
}
