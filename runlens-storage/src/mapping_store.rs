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

//! Database-managed model pricing mappings

use sqlx::{Row, SqlitePool};

use runlens_core::{ModelMapping, PricingUnit};

use crate::error::{Result, StorageError};
use crate::run_store::parse_uuid;
use crate::schema::{decode_timestamp, encode_timestamp};

#[derive(Clone)]
pub struct MappingStore {
    pool: SqlitePool,
}

impl MappingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, mapping: &ModelMapping) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO model_mapping
                (name, pattern, unit, input_cost, output_cost, project_id, start_date, provider,
                 input_caching_cost_reduction)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) RETURNING id",
        )
        .bind(&mapping.name)
        .bind(&mapping.pattern)
        .bind(mapping.unit.as_str())
        .bind(mapping.input_cost)
        .bind(mapping.output_cost)
        .bind(mapping.project_id.map(|id| id.to_string()))
        .bind(mapping.start_date.as_ref().map(encode_timestamp))
        .bind(mapping.provider.as_deref())
        .bind(mapping.input_caching_cost_reduction)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list(&self) -> Result<Vec<ModelMapping>> {
        let rows = sqlx::query(
            "SELECT name, pattern, unit, input_cost, output_cost, project_id, start_date, provider,
                    input_caching_cost_reduction
             FROM model_mapping ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let unit: String = row.try_get("unit")?;
                Ok(ModelMapping {
                    name: row.try_get("name")?,
                    pattern: row.try_get("pattern")?,
                    unit: PricingUnit::parse(&unit).ok_or_else(|| {
                        StorageError::InvalidRow(format!("unknown pricing unit '{}'", unit))
                    })?,
                    input_cost: row.try_get("input_cost")?,
                    output_cost: row.try_get("output_cost")?,
                    project_id: row
                        .try_get::<Option<String>, _>("project_id")?
                        .map(|s| parse_uuid(&s))
                        .transpose()?,
                    start_date: row
                        .try_get::<Option<String>, _>("start_date")?
                        .map(|s| decode_timestamp(&s))
                        .transpose()?,
                    provider: row.try_get("provider")?,
                    input_caching_cost_reduction: row.try_get("input_caching_cost_reduction")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{project, ts, TestDb};

    #[tokio::test]
    async fn test_mapping_roundtrip() {
        let db = TestDb::new().await;
        let project_id = project(&db.storage).await;
        let mapping = ModelMapping {
            name: "custom-llama".into(),
            pattern: "^llama-3".into(),
            unit: PricingUnit::Tokens,
            input_cost: 0.5,
            output_cost: 1.5,
            project_id: Some(project_id),
            start_date: Some(ts(0)),
            provider: Some("meta".into()),
            input_caching_cost_reduction: 0.25,
        };
        db.storage.mappings().insert(&mapping).await.unwrap();
        let listed = db.storage.mappings().list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pattern, "^llama-3");
        assert_eq!(listed[0].project_id, Some(project_id));
        assert_eq!(listed[0].start_date, Some(ts(0)));
        assert_eq!(listed[0].input_caching_cost_reduction, 0.25);
    }
}
