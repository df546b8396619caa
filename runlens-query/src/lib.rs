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

//! Runlens Query Engine
//!
//! Read-side views over the run store: thread reconstruction, usage
//! aggregation, and the cost backfill job.

pub mod backfill;
pub mod error;
pub mod thread;
pub mod usage;

pub use backfill::{BackfillReport, CostBackfill, DEFAULT_BATCH_SIZE};
pub use error::{QueryError, Result};
pub use thread::{flatten_messages, RunArena, RunGraph, ThreadReconstructor};
pub use usage::{
    aggregate_usage, fill_gaps, UsageAggregator, UsageGrouping, UsagePoint, DEFAULT_WINDOW_DAYS,
};
