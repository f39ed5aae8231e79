// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

pub mod adapter;
pub mod artifacts;
pub mod batch;
pub mod config;
pub mod decoder;
pub mod domains;
pub mod error;
pub mod executor;
pub mod generator;
pub mod graph;
pub mod pipeline;
pub mod prompt;
pub mod selector;
pub mod types;

pub use adapter::{AdaptedScript, CodeAdapter};
pub use artifacts::{ArtifactSet, ArtifactStore, HistoryEntry};
pub use batch::{load_queries, parse_queries, BatchOptions, BatchQuery, BatchReport, BatchSummary};
pub use config::{PipelineConfig, RuntimeMode};
pub use decoder::{decode, DecodeTier, DecodedResponse};
pub use domains::{Domain, DomainRegistry};
pub use error::{PipelineError, PipelineResult};
pub use executor::{ExecutionOutcome, SandboxedExecutor, SplitTable};
pub use generator::{CodeGenerator, CodeReviewer};
pub use graph::{GraphRun, NodeId, QueryGraph, QueryState, StateUpdate};
pub use pipeline::{QueryPipeline, ScriptRun};
pub use prompt::build_prompt;
pub use selector::{
    select_by_keywords, DomainClassifier, DomainSelection, DomainSelector, ModelDomainClassifier,
    SelectionMethod,
};
pub use types::{ConversationTurn, QueryRequest, QueryResponse, Role};
