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

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use runlens_query::{fill_gaps, UsageGrouping, UsagePoint, DEFAULT_WINDOW_DAYS};
use runlens_storage::DailyCount;

use crate::api::{ApiError, AppState};
use crate::validation::{body_project, parse_uuid_field, validate_window_days};

/// POST /v1/usage - Runs per day over the last 30 days, newest first
///
/// The body is optional; `projectId` (or legacy `appId`) narrows the count
/// to one project.
#[tracing::instrument(skip(state, body))]
pub async fn get_daily_usage(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<DailyCount>>, ApiError> {
    let project_id = if body.is_empty() {
        None
    } else {
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))?;
        body_project(&value)
            .map(|raw| parse_uuid_field("projectId", &raw))
            .transpose()
            .map_err(|e| ApiError::from(vec![e]))?
    };

    let counts = state.usage.daily_counts(project_id).await?;
    debug!("Daily usage: {} days with runs", counts.len());
    Ok(Json(counts))
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageParams {
    pub days: Option<i64>,
    pub group_by: Option<String>,
    pub radar_id: Option<Uuid>,
    /// Add zero-count points for days without runs
    #[serde(default)]
    pub dense: bool,
}

/// GET /v1/projects/:project_id/usage?days=30&group_by=type
#[tracing::instrument(skip(state))]
pub async fn get_project_usage(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(params): Query<UsageParams>,
) -> Result<Json<Vec<UsagePoint>>, ApiError> {
    let days = params.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    validate_window_days(days)?;
    let grouping: UsageGrouping = match params.group_by.as_deref() {
        Some(raw) => raw.parse()?,
        None => UsageGrouping::default(),
    };

    let points = state
        .usage
        .get_usage(project_id, days, grouping, params.radar_id)
        .await?;

    let points = if params.dense {
        let today = Utc::now().date_naive();
        fill_gaps(points, today - Duration::days(days - 1), today)
    } else {
        points
    };
    Ok(Json(points))
}
