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

//! Check logic to SQL
//!
//! Translates a check tree (`["AND" | "OR", check | tree, ...]`) into a SQL
//! predicate over the `run` table. Only field-backed checks have a SQL form;
//! every other check id becomes `1 = 1` and is decided in-process. Callers
//! that need an exact verdict test the tree with [`is_sql_logic`] first.

use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};

use crate::error::{Result, StorageError};

/// Append the predicate for `logic` to `qb`, wrapped in parentheses.
pub fn push_logic_sql(qb: &mut QueryBuilder<'_, Sqlite>, logic: &Value) -> Result<()> {
    match logic {
        Value::Array(items) => {
            let (operator, rest) = match items.first() {
                Some(Value::String(op)) if op == "OR" => (" OR ", &items[1..]),
                Some(Value::String(_)) => (" AND ", &items[1..]),
                _ => (" AND ", &items[..]),
            };
            if rest.is_empty() {
                qb.push("(1 = 1)");
                return Ok(());
            }
            qb.push("(");
            for (i, item) in rest.iter().enumerate() {
                if i > 0 {
                    qb.push(operator);
                }
                push_logic_sql(qb, item)?;
            }
            qb.push(")");
            Ok(())
        }
        Value::Object(_) => push_check_sql(qb, logic),
        Value::Null => {
            qb.push("(1 = 1)");
            Ok(())
        }
        other => Err(StorageError::InvalidRow(format!(
            "invalid check element: {}",
            other
        ))),
    }
}

/// Whether `id` names a check that has a SQL form.
pub fn is_sql_check(id: &str) -> bool {
    matches!(
        id,
        "type" | "models" | "tags" | "status" | "date" | "duration" | "cost" | "tokens" | "radar"
    )
}

/// Whether every check in `logic` has a SQL form, so the rendered predicate
/// is exact rather than a superset.
pub fn is_sql_logic(logic: &Value) -> bool {
    match logic {
        Value::Array(items) => items.iter().all(|item| match item {
            Value::String(_) => true,
            other => is_sql_logic(other),
        }),
        Value::Object(_) => logic
            .get("id")
            .and_then(Value::as_str)
            .map_or(false, is_sql_check),
        Value::Null => true,
        _ => false,
    }
}

fn push_check_sql(qb: &mut QueryBuilder<'_, Sqlite>, check: &Value) -> Result<()> {
    let id = check.get("id").and_then(Value::as_str).unwrap_or_default();
    let params = check.get("params").cloned().unwrap_or(Value::Null);

    qb.push("(");
    match id {
        "type" => {
            let run_type = str_param(&params, "type")?;
            if run_type == "trace" {
                qb.push("run.type IN ('agent', 'chain') AND run.parent_run_id IS NULL");
            } else {
                qb.push("run.type = ");
                qb.push_bind(run_type);
            }
        }
        "models" => {
            let names = string_list(&params, "names");
            push_in_list(qb, "run.name", names);
        }
        "tags" => {
            let tags = string_list(&params, "tags");
            if tags.is_empty() {
                qb.push("1 = 0");
            } else {
                qb.push("EXISTS (SELECT 1 FROM json_each(run.tags) WHERE json_each.value IN (");
                let mut sep = qb.separated(", ");
                for tag in tags {
                    sep.push_bind(tag);
                }
                qb.push("))");
            }
        }
        "status" => {
            qb.push("run.status = ");
            qb.push_bind(str_param(&params, "status")?);
        }
        "date" => {
            let op = sql_operator(&params)?;
            qb.push("run.created_at ");
            qb.push(op);
            qb.push(" ");
            qb.push_bind(str_param(&params, "date")?);
        }
        "duration" => {
            let op = sql_operator(&params)?;
            qb.push(
                "run.ended_at IS NOT NULL AND \
                 (julianday(run.ended_at) - julianday(run.created_at)) * 86400.0 ",
            );
            qb.push(op);
            qb.push(" ");
            qb.push_bind(num_param(&params, "duration")?);
        }
        "cost" => {
            let op = sql_operator(&params)?;
            qb.push("run.cost ");
            qb.push(op);
            qb.push(" ");
            qb.push_bind(num_param(&params, "cost")?);
        }
        "tokens" => {
            let op = sql_operator(&params)?;
            let column = match params.get("field").and_then(Value::as_str) {
                Some("prompt") => "run.prompt_tokens",
                Some("completion") => "run.completion_tokens",
                _ => "(run.prompt_tokens + run.completion_tokens)",
            };
            qb.push(column);
            qb.push(" ");
            qb.push(op);
            qb.push(" ");
            qb.push_bind(num_param(&params, "tokens")?);
        }
        "radar" => {
            let ids = string_list(&params, "ids");
            qb.push(
                "EXISTS (SELECT 1 FROM radar_result rr WHERE rr.run_id = run.id \
                 AND rr.passed = 1 AND ",
            );
            push_in_list(qb, "rr.radar_id", ids);
            qb.push(")");
        }
        _ => {
            qb.push("1 = 1");
        }
    }
    qb.push(")");
    Ok(())
}

fn push_in_list(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: Vec<String>) {
    if values.is_empty() {
        qb.push("1 = 0");
        return;
    }
    qb.push(column);
    qb.push(" IN (");
    let mut sep = qb.separated(", ");
    for value in values {
        sep.push_bind(value);
    }
    qb.push(")");
}

fn sql_operator(params: &Value) -> Result<&'static str> {
    match params.get("operator").and_then(Value::as_str) {
        Some("gt") => Ok(">"),
        Some("gte") => Ok(">="),
        Some("lt") => Ok("<"),
        Some("lte") => Ok("<="),
        Some("eq") => Ok("="),
        Some("neq") => Ok("!="),
        other => Err(StorageError::InvalidRow(format!(
            "unsupported operator: {:?}",
            other
        ))),
    }
}

fn str_param(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StorageError::InvalidRow(format!("missing check param '{}'", key)))
}

fn num_param(params: &Value, key: &str) -> Result<f64> {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| StorageError::InvalidRow(format!("missing numeric check param '{}'", key)))
}

fn string_list(params: &Value, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(logic: Value) -> String {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("");
        push_logic_sql(&mut qb, &logic).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn test_and_or_nesting() {
        let sql = render(json!([
            "AND",
            {"id": "type", "params": {"type": "llm"}},
            ["OR",
                {"id": "cost", "params": {"operator": "gt", "cost": 1}},
                {"id": "assertion", "params": {"assertion": "polite"}}
            ]
        ]));
        assert_eq!(
            sql,
            "((run.type = ?) AND ((run.cost > ?) OR (1 = 1)))"
        );
    }

    #[test]
    fn test_empty_logic_matches_everything() {
        assert_eq!(render(json!(["AND"])), "(1 = 1)");
        assert_eq!(render(json!([])), "(1 = 1)");
    }

    #[test]
    fn test_unsupported_operator_is_an_error() {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("");
        let logic = json!(["AND", {"id": "cost", "params": {"operator": "between", "cost": 1}}]);
        assert!(push_logic_sql(&mut qb, &logic).is_err());
    }

    #[test]
    fn test_sql_check_ids() {
        assert!(is_sql_check("models"));
        assert!(!is_sql_check("toxicity"));
        assert!(!is_sql_check("length"));
    }

    #[test]
    fn test_sql_logic_requires_every_leaf() {
        assert!(is_sql_logic(&json!(["AND", {"id": "models", "params": {"names": ["a"]}}])));
        assert!(is_sql_logic(&json!(["OR", ["AND", {"id": "radar", "params": {}}]])));
        assert!(is_sql_logic(&json!(["AND"])));
        assert!(!is_sql_logic(&json!([
            "AND",
            {"id": "type", "params": {"type": "llm"}},
            ["OR", {"id": "length", "params": {"operator": "gt", "length": 1000}}]
        ])));
        assert!(!is_sql_logic(&json!(["AND", {"id": "pii", "params": {}}])));
    }
}
