// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP API handlers and shared state

pub mod health;
pub mod ingest;
pub mod projects;
pub mod runs;
pub mod templates;
pub mod usage;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use runlens_core::ModelPricingRegistry;
use runlens_evals::{CheckEngine, EvalError};
use runlens_query::{QueryError, UsageAggregator};
use runlens_storage::{Storage, StorageError};

use crate::ingestion::EventProcessor;

pub use health::health_check;
pub use ingest::ingest_events;
pub use projects::create_project;
pub use runs::{evaluate_run, get_related_runs, get_run_messages};
pub use templates::get_latest_template_version;
pub use usage::{get_daily_usage, get_project_usage};

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                error!("Request failed: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Bodies that are not JSON, or not the expected shape, are client errors
/// reported in the usual `{"error": ..}` body.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            QueryError::Storage(e) => e.into(),
        }
    }
}

impl From<EvalError> for ApiError {
    fn from(e: EvalError) -> Self {
        match e {
            EvalError::MissingField(_)
            | EvalError::InvalidInput(_)
            | EvalError::UnknownEvaluator(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub pricing: ModelPricingRegistry,
    pub checks: Arc<CheckEngine>,
    pub usage: UsageAggregator,
    pub events: EventProcessor,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(storage: Storage, pricing: ModelPricingRegistry, checks: Arc<CheckEngine>) -> Self {
        Self {
            usage: UsageAggregator::new(storage.runs()),
            events: EventProcessor::new(storage.runs(), pricing.clone()),
            storage,
            pricing,
            checks,
            started_at: Instant::now(),
        }
    }
}
