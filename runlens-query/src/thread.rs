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

//! Thread reconstruction
//!
//! Rebuilds a conversation from the run graph. Starting at a run, every run
//! that names an already-collected run as its parent is pulled in, level by
//! level, and the collected runs' message arrays are flattened into a single
//! chronological list.
//!
//! Stored data is not trusted to be acyclic: traversal keeps a visited set
//! and each run is expanded at most once.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use runlens_core::{Message, Run};
use runlens_storage::RunStore;

use crate::error::Result;

/// Parents expanded per child lookup, kept under SQLite's bind limit.
const MAX_FRONTIER_BATCH: usize = 500;

/// Read access to the parent/child run graph of a project.
#[async_trait]
pub trait RunGraph: Send + Sync {
    async fn get_run(&self, project_id: Uuid, id: Uuid) -> Result<Option<Run>>;

    /// Runs in `project_id` whose parent is one of `parent_ids`.
    async fn children_of(&self, project_id: Uuid, parent_ids: &[Uuid]) -> Result<Vec<Run>>;
}

#[async_trait]
impl RunGraph for RunStore {
    async fn get_run(&self, project_id: Uuid, id: Uuid) -> Result<Option<Run>> {
        Ok(RunStore::get_run(self, project_id, id).await?)
    }

    async fn children_of(&self, project_id: Uuid, parent_ids: &[Uuid]) -> Result<Vec<Run>> {
        Ok(RunStore::children_of(self, project_id, parent_ids).await?)
    }
}

/// In-memory run graph indexed by id
#[derive(Debug, Default, Clone)]
pub struct RunArena {
    runs: HashMap<Uuid, Run>,
}

impl RunArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, run: Run) {
        self.runs.insert(run.id, run);
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl FromIterator<Run> for RunArena {
    fn from_iter<I: IntoIterator<Item = Run>>(iter: I) -> Self {
        Self {
            runs: iter.into_iter().map(|run| (run.id, run)).collect(),
        }
    }
}

#[async_trait]
impl RunGraph for RunArena {
    async fn get_run(&self, project_id: Uuid, id: Uuid) -> Result<Option<Run>> {
        Ok(self
            .runs
            .get(&id)
            .filter(|run| run.project_id == project_id)
            .cloned())
    }

    async fn children_of(&self, project_id: Uuid, parent_ids: &[Uuid]) -> Result<Vec<Run>> {
        let parents: HashSet<&Uuid> = parent_ids.iter().collect();
        let mut children: Vec<Run> = self
            .runs
            .values()
            .filter(|run| run.project_id == project_id)
            .filter(|run| run.parent_run_id.map_or(false, |p| parents.contains(&p)))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(children)
    }
}

/// Assembles threads from a [`RunGraph`]
pub struct ThreadReconstructor<G> {
    graph: G,
}

impl<G: RunGraph> ThreadReconstructor<G> {
    pub fn new(graph: G) -> Self {
        Self { graph }
    }

    /// The run `run_id` and every run transitively parented by it, restricted
    /// to `project_id`, ordered by creation time.
    ///
    /// An unknown run, or one from another project, yields an empty list.
    pub async fn related_runs(&self, run_id: Uuid, project_id: Uuid) -> Result<Vec<Run>> {
        let Some(start) = self.graph.get_run(project_id, run_id).await? else {
            debug!("Run {} not found in project {}", run_id, project_id);
            return Ok(Vec::new());
        };

        let mut visited: HashSet<Uuid> = HashSet::from([start.id]);
        let mut frontier = vec![start.id];
        let mut related = vec![start];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for batch in frontier.chunks(MAX_FRONTIER_BATCH) {
                for child in self.graph.children_of(project_id, batch).await? {
                    if visited.insert(child.id) {
                        next.push(child.id);
                        related.push(child);
                    } else {
                        warn!("Run {} reached twice while walking thread {}", child.id, run_id);
                    }
                }
            }
            frontier = next;
        }

        // Stable: discovery order breaks timestamp ties
        related.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(related)
    }

    /// Chronological messages of the thread rooted at `thread_id`.
    ///
    /// The root run is a marker and contributes nothing. Each other run adds
    /// its input messages, then its output messages, stamped with the run's
    /// creation time.
    pub async fn messages(&self, thread_id: Uuid, project_id: Uuid) -> Result<Vec<Message>> {
        let runs = self.related_runs(thread_id, project_id).await?;
        Ok(flatten_messages(thread_id, &runs))
    }
}

/// Flatten the message arrays of `runs`, skipping the run `root_id`.
pub fn flatten_messages(root_id: Uuid, runs: &[Run]) -> Vec<Message> {
    let mut messages: Vec<Message> = runs
        .iter()
        .filter(|run| run.id != root_id)
        .flat_map(|run| {
            message_array(run.input.as_ref())
                .chain(message_array(run.output.as_ref()))
                .filter_map(move |value| Message::from_value(value, run.created_at))
        })
        .collect();
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    messages
}

fn message_array(field: Option<&Value>) -> impl Iterator<Item = &Value> {
    field
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use runlens_core::RunType;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn run(project: Uuid, run_type: RunType, parent: Option<Uuid>, at: i64) -> Run {
        let mut run = Run::new(Uuid::new_v4(), project, run_type, ts(at));
        run.parent_run_id = parent;
        run
    }

    #[tokio::test]
    async fn test_thread_messages_exclude_root() {
        let project = Uuid::new_v4();
        let root = run(project, RunType::Thread, None, 0);
        let mut child = run(project, RunType::Chat, Some(root.id), 5);
        child.input = Some(json!([{"role": "user", "text": "hi"}]));
        child.output = Some(json!([{"role": "ai", "text": "hello"}]));
        let root_id = root.id;

        let arena: RunArena = [root, child].into_iter().collect();
        let threads = ThreadReconstructor::new(arena);
        let messages = threads.messages(root_id, project).await.unwrap();

        let rendered: Vec<Value> = messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap())
            .collect();
        assert_eq!(
            rendered,
            vec![
                json!({"role": "user", "text": "hi", "createdAt": ts(5)}),
                json!({"role": "ai", "text": "hello", "createdAt": ts(5)}),
            ]
        );
    }

    #[tokio::test]
    async fn test_related_runs_walks_descendants_in_order() {
        let project = Uuid::new_v4();
        let root = run(project, RunType::Thread, None, 0);
        let a = run(project, RunType::Chat, Some(root.id), 20);
        let b = run(project, RunType::Chat, Some(root.id), 10);
        let nested = run(project, RunType::Llm, Some(a.id), 15);
        let foreign = run(Uuid::new_v4(), RunType::Chat, Some(root.id), 1);
        let unrelated = run(project, RunType::Chat, None, 2);
        let expected = vec![root.id, b.id, nested.id, a.id];
        let root_id = root.id;

        let arena: RunArena = [root, a, b, nested, foreign, unrelated].into_iter().collect();
        let related = ThreadReconstructor::new(arena)
            .related_runs(root_id, project)
            .await
            .unwrap();
        assert_eq!(related.iter().map(|r| r.id).collect::<Vec<_>>(), expected);
    }

    #[tokio::test]
    async fn test_unknown_or_foreign_run_is_empty() {
        let project = Uuid::new_v4();
        let root = run(project, RunType::Thread, None, 0);
        let root_id = root.id;
        let threads = ThreadReconstructor::new([root].into_iter().collect::<RunArena>());

        assert!(threads.related_runs(Uuid::new_v4(), project).await.unwrap().is_empty());
        assert!(threads.related_runs(root_id, Uuid::new_v4()).await.unwrap().is_empty());
        assert!(threads.messages(root_id, Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let project = Uuid::new_v4();
        let mut a = run(project, RunType::Chain, None, 0);
        let b = run(project, RunType::Chain, Some(a.id), 1);
        let c = run(project, RunType::Chain, Some(b.id), 2);
        // a -> b -> c -> a
        a.parent_run_id = Some(c.id);
        let start = a.id;

        let arena: RunArena = [a, b, c].into_iter().collect();
        let related = ThreadReconstructor::new(arena)
            .related_runs(start, project)
            .await
            .unwrap();
        assert_eq!(related.len(), 3);
    }

    #[test]
    fn test_non_array_fields_are_skipped() {
        let project = Uuid::new_v4();
        let root = run(project, RunType::Thread, None, 0);
        let mut early = run(project, RunType::Llm, Some(root.id), 1);
        early.input = Some(json!("plain prompt"));
        early.output = Some(json!([{"role": "assistant", "content": "one"}, "junk", 3]));
        let mut late = run(project, RunType::Llm, Some(root.id), 2);
        late.input = Some(json!([
            {"role": "user", "content": "two"},
            {"role": "user", "content": "three"}
        ]));

        let messages = flatten_messages(root.id, &[root.clone(), late, early]);
        let texts: Vec<_> = messages.iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_run_store_backed_thread() {
        let storage = runlens_storage::Storage::connect("sqlite::memory:").await.unwrap();
        let project = storage.projects().create("threads").await.unwrap().id;
        let root = run(project, RunType::Thread, None, 0);
        let mut turn = run(project, RunType::Chat, Some(root.id), 3);
        turn.input = Some(json!([{"role": "user", "content": "ping"}]));
        turn.output = Some(json!([{"role": "assistant", "content": "pong"}]));
        storage.runs().insert_run(&root).await.unwrap();
        storage.runs().insert_run(&turn).await.unwrap();

        let threads = ThreadReconstructor::new(storage.runs());
        let messages = threads.messages(root.id, project).await.unwrap();
        let texts: Vec<_> = messages.iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["ping", "pong"]);
    }
}
