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

//! Runlens Core
//!
//! Fundamental data structures for recorded LLM runs: the run record itself,
//! ingestion events and their normalization, and the cost calculator.

pub mod error;
pub mod event;
pub mod model_pricing;
pub mod run;

pub use error::{CoreError, Result};
pub use event::{clean_event, ensure_uuid, uuid_from_seed, Event, EventKind, TokenUsage};
pub use model_pricing::{
    clean_model_name, round_cost, CostInput, CustomPricingOverride, ModelMapping, ModelPricing,
    ModelPricingRegistry, PricingError, PricingPriority, PricingUnit, CACHED_CALL_THRESHOLD_MS,
};
pub use run::{Message, Run, RunStatus, RunType};
