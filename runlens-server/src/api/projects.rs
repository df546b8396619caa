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
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use runlens_storage::Project;

use crate::api::{ApiError, AppState};

/// Request body for POST /v1/projects
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

/// Response for POST /v1/projects
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub project_id: String,
    pub name: String,
    pub created_at: String,
}

impl From<Project> for CreateProjectResponse {
    fn from(project: Project) -> Self {
        Self {
            project_id: project.id.to_string(),
            name: project.name,
            created_at: project.created_at.to_rfc3339(),
        }
    }
}

/// POST /v1/projects
/// Create a project that events can be ingested into
#[tracing::instrument(skip(state, payload))]
pub async fn create_project(
    State(state): State<AppState>,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateProjectResponse>), ApiError> {
    let Json(payload) = payload?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Project name cannot be empty".to_string()));
    }

    let project = state.storage.projects().create(name).await?;
    info!("Created project {} ({})", project.id, project.name);
    Ok((StatusCode::CREATED, Json(project.into())))
}
