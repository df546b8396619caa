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
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use runlens_storage::TemplateVersion;

use crate::api::{ApiError, AppState};
use crate::validation::require_project;

pub const TEMPLATE_NOT_FOUND: &str = "Template not found, is the project ID correct?";

#[derive(Debug, Deserialize)]
pub struct LatestVersionParams {
    #[serde(alias = "app_id")]
    pub project_id: Option<String>,
    pub slug: Option<String>,
}

/// Latest published template version, as fetched by SDKs
#[derive(Debug, Serialize)]
pub struct TemplateVersionResponse {
    pub id: String,
    pub template_id: String,
    pub slug: String,
    pub content: Value,
    pub extra: Option<Value>,
    pub test_values: Option<Value>,
    pub version: i64,
    pub created_at: String,
}

impl From<TemplateVersion> for TemplateVersionResponse {
    fn from(version: TemplateVersion) -> Self {
        Self {
            id: version.id.to_string(),
            template_id: version.template_id.to_string(),
            slug: version.slug,
            content: version.content,
            extra: version.extra,
            test_values: version.test_values,
            version: version.version,
            created_at: version.created_at.to_rfc3339(),
        }
    }
}

/// GET /v1/template_versions/latest?project_id=..&slug=..
#[tracing::instrument(skip(state))]
pub async fn get_latest_template_version(
    State(state): State<AppState>,
    Query(params): Query<LatestVersionParams>,
) -> Result<Json<TemplateVersionResponse>, ApiError> {
    let project_id = require_project(params.project_id.as_deref())?;
    let slug = params
        .slug
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("slug is required".to_string()))?;

    let version = state
        .storage
        .templates()
        .latest_version(project_id, &slug)
        .await?
        .ok_or_else(|| ApiError::NotFound(TEMPLATE_NOT_FOUND.to_string()))?;

    Ok(Json(version.into()))
}
