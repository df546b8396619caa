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

//! Ingestion API for SDK events
//!
//! Accepts a batch of run and log events via POST and applies them to the
//! run store. The request succeeds once the batch has been processed; events
//! that fail are reported individually in `results`.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::{ApiError, AppState};
use crate::ingestion::IngestResult;
use crate::validation::IngestRequest;

#[derive(Debug, Default, Deserialize)]
pub struct IngestParams {
    pub project_id: Option<String>,
}

/// Response for POST /v1/runs/ingest
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub results: Vec<IngestResult>,
}

/// POST /v1/runs/ingest - Ingest a batch of events
///
/// # Request Body
/// ```json
/// {
///   "events": [
///     {
///       "type": "llm",
///       "event": "start",
///       "runId": "6f9619ff-8b86-d011-b42d-00cf4fc964ff",
///       "timestamp": "2024-05-01T10:00:00Z",
///       "name": "gpt-4o",
///       "input": [{"role": "user", "content": "hi"}]
///     }
///   ]
/// }
/// ```
///
/// # Response Codes
/// - 200: Batch processed, per-event outcome in `results`
/// - 400: Body is not JSON, `events` is missing or malformed, or no usable
///   project id
/// - 401: The project does not exist
#[tracing::instrument(skip(state, params, body))]
pub async fn ingest_events(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(body) = body?;
    let request = IngestRequest::parse(&body, params.project_id.as_deref())?;
    debug!(
        "Ingesting {} events for project {}",
        request.events.len(),
        request.project_id
    );

    if !state.storage.projects().exists(request.project_id).await? {
        return Err(ApiError::Unauthorized(
            "This project does not exist".to_string(),
        ));
    }

    let results = state
        .events
        .process_events(request.project_id, request.events)
        .await;
    Ok(Json(IngestResponse { results }))
}
