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

//! Usage aggregation for dashboard charts
//!
//! Runs are bucketed by UTC day and by type and/or name. Two counting
//! policies coexist and are kept apart on purpose:
//!
//! - cost: runs without a cost are left out of the sum but still counted;
//! - checks: runs without a check result count neither as passed nor failed.
//!
//! Only buckets with at least one run are produced. [`fill_gaps`] turns the
//! result into a dense daily series.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use runlens_core::round_cost;
use runlens_storage::{DailyCount, RunStore, UsageRecord};

use crate::error::{QueryError, Result};

/// Trailing window used when the caller does not pick one
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Dimensions a usage bucket is keyed by, besides the day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageGrouping {
    Day,
    #[default]
    Type,
    Name,
    TypeAndName,
}

impl FromStr for UsageGrouping {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "day" | "none" => Ok(UsageGrouping::Day),
            "type" => Ok(UsageGrouping::Type),
            "name" => Ok(UsageGrouping::Name),
            "type_and_name" | "type,name" => Ok(UsageGrouping::TypeAndName),
            other => Err(QueryError::InvalidArgument(format!(
                "unknown grouping '{}'",
                other
            ))),
        }
    }
}

impl UsageGrouping {
    fn by_type(self) -> bool {
        matches!(self, UsageGrouping::Type | UsageGrouping::TypeAndName)
    }

    fn by_name(self) -> bool {
        matches!(self, UsageGrouping::Name | UsageGrouping::TypeAndName)
    }
}

/// One aggregated bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePoint {
    pub date: NaiveDate,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub run_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    pub count: u64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// `None` when no run in the bucket has a known cost
    pub cost: Option<f64>,
    pub passed: u64,
    pub failed: u64,
}

impl UsagePoint {
    fn empty(date: NaiveDate, run_type: Option<String>, name: Option<String>) -> Self {
        Self {
            date,
            run_type,
            name,
            count: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: None,
            passed: 0,
            failed: 0,
        }
    }

    fn add(&mut self, record: &UsageRecord) {
        self.count += 1;
        self.prompt_tokens += record.prompt_tokens.unwrap_or(0);
        self.completion_tokens += record.completion_tokens.unwrap_or(0);
        if let Some(cost) = record.cost {
            self.cost = Some(self.cost.unwrap_or(0.0) + cost);
        }
        match record.check_passed {
            Some(true) => self.passed += 1,
            Some(false) => self.failed += 1,
            None => {}
        }
    }
}

/// Bucket `records`, ordered by day, then type, then name.
pub fn aggregate_usage(records: &[UsageRecord], grouping: UsageGrouping) -> Vec<UsagePoint> {
    let mut buckets: BTreeMap<(NaiveDate, Option<String>, Option<String>), UsagePoint> =
        BTreeMap::new();

    for record in records {
        let date = record.created_at.date_naive();
        let run_type = grouping
            .by_type()
            .then(|| record.run_type.as_str().to_string());
        let name = if grouping.by_name() {
            record.name.clone()
        } else {
            None
        };
        buckets
            .entry((date, run_type.clone(), name.clone()))
            .or_insert_with(|| UsagePoint::empty(date, run_type, name))
            .add(record);
    }

    buckets
        .into_values()
        .map(|mut point| {
            point.cost = point.cost.map(round_cost);
            point
        })
        .collect()
}

/// Insert a zero-count point for every day in `start..=end` that has none.
pub fn fill_gaps(points: Vec<UsagePoint>, start: NaiveDate, end: NaiveDate) -> Vec<UsagePoint> {
    let mut by_day: BTreeMap<NaiveDate, Vec<UsagePoint>> = BTreeMap::new();
    for point in points {
        by_day.entry(point.date).or_default().push(point);
    }

    let mut day = start;
    while day <= end {
        by_day
            .entry(day)
            .or_insert_with(|| vec![UsagePoint::empty(day, None, None)]);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    by_day.into_values().flatten().collect()
}

/// Usage queries over the run store
#[derive(Clone)]
pub struct UsageAggregator {
    runs: RunStore,
}

impl UsageAggregator {
    pub fn new(runs: RunStore) -> Self {
        Self { runs }
    }

    /// Usage of `project_id` over the trailing `window_days` days.
    pub async fn get_usage(
        &self,
        project_id: Uuid,
        window_days: i64,
        grouping: UsageGrouping,
        radar_id: Option<Uuid>,
    ) -> Result<Vec<UsagePoint>> {
        let since = window_start(Utc::now(), window_days)?;
        self.get_usage_since(project_id, since, grouping, radar_id).await
    }

    pub async fn get_usage_since(
        &self,
        project_id: Uuid,
        since: DateTime<Utc>,
        grouping: UsageGrouping,
        radar_id: Option<Uuid>,
    ) -> Result<Vec<UsagePoint>> {
        let records = self.runs.usage_records(project_id, since, radar_id).await?;
        Ok(aggregate_usage(&records, grouping))
    }

    /// `{date, count}` per day over the default window, newest first.
    pub async fn daily_counts(&self, project_id: Option<Uuid>) -> Result<Vec<DailyCount>> {
        let since = window_start(Utc::now(), DEFAULT_WINDOW_DAYS)?;
        Ok(self.runs.daily_counts(project_id, since).await?)
    }
}

fn window_start(now: DateTime<Utc>, window_days: i64) -> Result<DateTime<Utc>> {
    if !(1..=366).contains(&window_days) {
        return Err(QueryError::InvalidArgument(format!(
            "window of {} days is out of range",
            window_days
        )));
    }
    Ok(now - Duration::days(window_days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use runlens_core::RunType;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn record(
        created_at: DateTime<Utc>,
        run_type: RunType,
        name: &str,
        cost: Option<f64>,
        check_passed: Option<bool>,
    ) -> UsageRecord {
        UsageRecord {
            created_at,
            run_type,
            name: Some(name.to_string()),
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
            cost,
            check_passed,
        }
    }

    #[test]
    fn test_null_cost_counted_but_not_summed() {
        let records = vec![
            record(at(1, 1), RunType::Llm, "gpt-4", Some(0.25), None),
            record(at(1, 2), RunType::Llm, "gpt-4", None, None),
            record(at(1, 3), RunType::Llm, "gpt-4", Some(0.5), None),
        ];
        let points = aggregate_usage(&records, UsageGrouping::Type);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 3);
        assert_eq!(points[0].cost, Some(0.75));
        assert_eq!(points[0].prompt_tokens, 30);
    }

    #[test]
    fn test_all_null_cost_is_unknown() {
        let records = vec![record(at(1, 1), RunType::Llm, "mystery", None, None)];
        let points = aggregate_usage(&records, UsageGrouping::Name);
        assert_eq!(points[0].cost, None);
        assert_eq!(points[0].count, 1);
    }

    #[test]
    fn test_unchecked_runs_excluded_from_pass_fail() {
        let records = vec![
            record(at(2, 1), RunType::Llm, "gpt-4", None, Some(true)),
            record(at(2, 2), RunType::Llm, "gpt-4", None, Some(false)),
            record(at(2, 3), RunType::Llm, "gpt-4", None, None),
            record(at(2, 4), RunType::Llm, "gpt-4", None, None),
        ];
        let point = &aggregate_usage(&records, UsageGrouping::Day)[0];
        assert_eq!(point.count, 4);
        assert_eq!((point.passed, point.failed), (1, 1));
    }

    #[test]
    fn test_grouping_and_empty_days_omitted() {
        let records = vec![
            record(at(1, 1), RunType::Llm, "gpt-4", None, None),
            record(at(1, 2), RunType::Tool, "search", None, None),
            record(at(3, 1), RunType::Llm, "claude-3-haiku", None, None),
            record(at(3, 2), RunType::Llm, "gpt-4", None, None),
        ];
        let by_type = aggregate_usage(&records, UsageGrouping::Type);
        let keys: Vec<_> = by_type
            .iter()
            .map(|p| (p.date.to_string(), p.run_type.clone().unwrap(), p.count))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("2024-05-01".to_string(), "llm".to_string(), 1),
                ("2024-05-01".to_string(), "tool".to_string(), 1),
                ("2024-05-03".to_string(), "llm".to_string(), 2),
            ]
        );

        let by_both = aggregate_usage(&records, UsageGrouping::TypeAndName);
        assert_eq!(by_both.len(), 4);
        assert!(by_both.iter().all(|p| p.run_type.is_some() && p.name.is_some()));
    }

    #[test]
    fn test_fill_gaps_makes_dense_series() {
        let records = vec![
            record(at(1, 1), RunType::Llm, "gpt-4", None, None),
            record(at(3, 1), RunType::Llm, "gpt-4", None, None),
        ];
        let start = at(1, 0).date_naive();
        let end = at(4, 0).date_naive();
        let dense = fill_gaps(aggregate_usage(&records, UsageGrouping::Day), start, end);
        let counts: Vec<_> = dense.iter().map(|p| (p.date.to_string(), p.count)).collect();
        assert_eq!(
            counts,
            vec![
                ("2024-05-01".to_string(), 1),
                ("2024-05-02".to_string(), 0),
                ("2024-05-03".to_string(), 1),
                ("2024-05-04".to_string(), 0),
            ]
        );
    }

    #[test]
    fn test_grouping_parse_and_window_bounds() {
        assert_eq!("name".parse::<UsageGrouping>().unwrap(), UsageGrouping::Name);
        assert!("weekly".parse::<UsageGrouping>().is_err());
        assert!(window_start(Utc::now(), 0).is_err());
        assert!(window_start(Utc::now(), 30).is_ok());
    }

    #[tokio::test]
    async fn test_aggregator_reads_check_results() {
        let storage = runlens_storage::Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("usage").await.unwrap().id;
        let now = Utc::now();
        let mut ids = Vec::new();
        for cost in [Some(0.1), None, Some(0.2)] {
            let mut run = runlens_core::Run::new(Uuid::new_v4(), project, RunType::Llm, now);
            run.name = Some("gpt-4".into());
            run.cost = cost;
            storage.runs().insert_run(&run).await.unwrap();
            ids.push(run.id);
        }
        let radar = runlens_storage::Radar {
            id: Uuid::new_v4(),
            project_id: project,
            description: None,
            view: serde_json::json!(["AND"]),
            checks: serde_json::json!(["AND"]),
            negative: false,
            created_at: now,
        };
        storage.radars().create_radar(&radar).await.unwrap();
        storage
            .radars()
            .insert_result(&runlens_storage::RadarResult {
                radar_id: radar.id,
                run_id: ids[0],
                results: serde_json::json!([]),
                passed: false,
                created_at: now,
            })
            .await
            .unwrap();

        let usage = UsageAggregator::new(storage.runs());
        let points = usage
            .get_usage(project, DEFAULT_WINDOW_DAYS, UsageGrouping::Type, None)
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 3);
        assert_eq!(points[0].cost.map(|c| (c * 100.0).round()), Some(30.0));
        assert_eq!((points[0].passed, points[0].failed), (0, 1));

        let daily = usage.daily_counts(Some(project)).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].count, 3);
    }
}
