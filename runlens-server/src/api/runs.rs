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

//! Thread views and on-demand checks for single runs

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use runlens_core::{Message, Run};
use runlens_evals::CheckOutcome;
use runlens_query::ThreadReconstructor;

use crate::api::{ApiError, AppState};
use crate::validation::{parse_check_logic, parse_uuid_field, require_project};

#[derive(Debug, Deserialize)]
pub struct ProjectParams {
    pub project_id: Option<String>,
}

/// GET /v1/runs/:run_id/related?project_id=..
///
/// The run and every run below it, oldest first. Unknown runs yield `[]`.
#[tracing::instrument(skip(state))]
pub async fn get_related_runs(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(params): Query<ProjectParams>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let project_id = require_project(params.project_id.as_deref())?;
    let reconstructor = ThreadReconstructor::new(state.storage.runs());
    let runs = reconstructor.related_runs(run_id, project_id).await?;
    debug!("Run {} has {} related runs", run_id, runs.len());
    Ok(Json(runs))
}

/// GET /v1/runs/:run_id/messages?project_id=..
///
/// Chronological messages of the thread rooted at the run.
#[tracing::instrument(skip(state))]
pub async fn get_run_messages(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(params): Query<ProjectParams>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let project_id = require_project(params.project_id.as_deref())?;
    let reconstructor = ThreadReconstructor::new(state.storage.runs());
    let messages = reconstructor.messages(run_id, project_id).await?;
    Ok(Json(messages))
}

/// Request body for POST /v1/runs/:run_id/evaluate
#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    #[serde(alias = "projectId")]
    pub project_id: String,
    pub checks: Value,
}

/// POST /v1/runs/:run_id/evaluate
///
/// Runs a check tree against one stored run and returns every leaf result.
#[tracing::instrument(skip(state, request))]
pub async fn evaluate_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    request: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Result<Json<CheckOutcome>, ApiError> {
    let Json(request) = request?;
    let project_id =
        parse_uuid_field("project_id", &request.project_id).map_err(|e| ApiError::from(vec![e]))?;
    let checks = parse_check_logic(&request.checks)?;

    let run = state
        .storage
        .runs()
        .get_run(project_id, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", run_id)))?;

    let checks = state
        .storage
        .radars()
        .resolve_radar_checks(run.id, &checks)
        .await?;
    let outcome = state.checks.run_checks(&run, &checks).await?;
    info!(
        "Evaluated run {}: passed={} ({} checks)",
        run_id,
        outcome.passed,
        outcome.results.len()
    );
    Ok(Json(outcome))
}
