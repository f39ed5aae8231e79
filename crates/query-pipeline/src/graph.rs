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

//! Conversational graph: `detect_domain` then `generate_code`, then
//! `execute_code_node` when execution is requested and enabled.
//!
//! Nodes never mutate state. Each returns a [`StateUpdate`] that
//! [`QueryState::merge`] folds in: messages are appended and any scalar set
//! on the update replaces the current value.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, span, warn, Instrument, Level};

use crate::artifacts::base_name;
use crate::domains::read_schema_doc;
use crate::error::PipelineError;
use crate::executor::ExecutionOutcome;
use crate::pipeline::QueryPipeline;
use crate::types::{ConversationTurn, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    DetectDomain,
    GenerateCode,
    #[serde(rename = "execute_code_node")]
    ExecuteCode,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::DetectDomain => "detect_domain",
            NodeId::GenerateCode => "generate_code",
            NodeId::ExecuteCode => "execute_code_node",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryState {
    pub messages: Vec<ConversationTurn>,
    #[serde(default)]
    pub forced_domain: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub schema_content: Option<String>,
    #[serde(default)]
    pub generated_code: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub execution: Option<ExecutionOutcome>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execute_requested: bool,
}

/// Partial state returned by a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<ConversationTurn>,
    pub domain: Option<String>,
    pub schema_content: Option<String>,
    pub generated_code: Option<String>,
    pub explanation: Option<String>,
    pub execution: Option<ExecutionOutcome>,
    pub error: Option<String>,
}

impl StateUpdate {
    fn failure(error: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            messages: vec![ConversationTurn::assistant(reply)],
            ..Self::default()
        }
    }
}

impl QueryState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            messages: vec![ConversationTurn::user(query)],
            ..Self::default()
        }
    }

    pub fn with_forced_domain(mut self, domain: impl Into<String>) -> Self {
        self.forced_domain = Some(domain.into());
        self
    }

    pub fn executing(mut self, execute: bool) -> Self {
        self.execute_requested = execute;
        self
    }

    pub fn merge(mut self, update: StateUpdate) -> Self {
        self.messages.extend(update.messages);
        if update.domain.is_some() {
            self.domain = update.domain;
        }
        if update.schema_content.is_some() {
            self.schema_content = update.schema_content;
        }
        if update.generated_code.is_some() {
            self.generated_code = update.generated_code;
        }
        if update.explanation.is_some() {
            self.explanation = update.explanation;
        }
        if update.execution.is_some() {
            self.execution = update.execution;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        self
    }

    /// Appends the next user turn and clears everything tied to the last one.
    pub fn continue_with(mut self, text: impl Into<String>) -> Self {
        self.messages.push(ConversationTurn::user(text));
        self.domain = None;
        self.schema_content = None;
        self.generated_code = None;
        self.explanation = None;
        self.execution = None;
        self.error = None;
        self
    }

    /// Content of the most recent user message.
    pub fn latest_user_query(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Turns before the latest user message.
    pub fn prior_turns(&self) -> &[ConversationTurn] {
        match self.messages.iter().rposition(|m| m.role == Role::User) {
            Some(i) => &self.messages[..i],
            None => &self.messages,
        }
    }

    pub fn last_reply(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct GraphRun {
    pub state: QueryState,
    pub visited: Vec<NodeId>,
}

pub struct QueryGraph {
    pipeline: Arc<QueryPipeline>,
    execution_enabled: bool,
}

impl QueryGraph {
    pub fn new(pipeline: Arc<QueryPipeline>) -> Self {
        let execution_enabled = pipeline.config().execution_enabled;
        Self {
            pipeline,
            execution_enabled,
        }
    }

    pub fn with_execution(mut self, enabled: bool) -> Self {
        self.execution_enabled = enabled;
        self
    }

    pub fn execution_enabled(&self) -> bool {
        self.execution_enabled
    }

    pub fn should_execute(&self, state: &QueryState) -> bool {
        state.error.is_none()
            && state.execute_requested
            && self.execution_enabled
            && state.generated_code.is_some()
    }

    fn next(&self, node: NodeId, state: &QueryState) -> Option<NodeId> {
        match node {
            NodeId::DetectDomain => Some(NodeId::GenerateCode),
            NodeId::GenerateCode => self.should_execute(state).then_some(NodeId::ExecuteCode),
            NodeId::ExecuteCode => None,
        }
    }

    #[instrument(skip(self, state), fields(turns = state.messages.len(), execute = state.execute_requested))]
    pub async fn invoke(&self, state: QueryState) -> GraphRun {
        let mut state = state;
        let mut visited = Vec::new();
        let mut current_opt = Some(NodeId::DetectDomain);

        while let Some(current) = current_opt.take() {
            let node_span = span!(Level::DEBUG, "graph_node", node = %current);
            let update = self.run_node(current, &state).instrument(node_span).await;
            state = state.merge(update);
            visited.push(current);
            current_opt = self.next(current, &state);
        }

        info!(
            visited = ?visited.iter().map(NodeId::as_str).collect::<Vec<_>>(),
            domain = ?state.domain,
            error = ?state.error,
            "Graph run complete"
        );
        GraphRun { state, visited }
    }

    async fn run_node(&self, node: NodeId, state: &QueryState) -> StateUpdate {
        if state.error.is_some() {
            debug!(node = %node, "Skipping node after earlier error");
            return StateUpdate::default();
        }
        match node {
            NodeId::DetectDomain => self.detect_domain(state).await,
            NodeId::GenerateCode => self.generate_code(state).await,
            NodeId::ExecuteCode => self.execute_code(state).await,
        }
    }

    async fn detect_domain(&self, state: &QueryState) -> StateUpdate {
        let Some(query) = state.latest_user_query() else {
            return StateUpdate::failure(
                "Expected a user message as the last message.",
                "Please send a question about one of the databases.",
            );
        };

        match self
            .pipeline
            .select_domain(query, state.forced_domain.as_deref())
            .await
        {
            Ok(selection) => {
                let domain = selection.domain;
                StateUpdate {
                    schema_content: Some(read_schema_doc(&domain)),
                    messages: vec![ConversationTurn::assistant(format!(
                        "I'll help you query the {} database.",
                        domain.name
                    ))],
                    domain: Some(domain.name),
                    ..StateUpdate::default()
                }
            }
            Err(e) => {
                warn!(error = %e, "Domain detection failed");
                StateUpdate::failure(
                    e.to_string(),
                    format!(
                        "I couldn't identify a supported database domain for your query. \
                         Please try again with a query about one of these domains: {}.",
                        self.pipeline.registry().names().join(", ")
                    ),
                )
            }
        }
    }

    async fn generate_code(&self, state: &QueryState) -> StateUpdate {
        let (Some(query), Some(domain_name)) = (state.latest_user_query(), state.domain.as_deref())
        else {
            return StateUpdate::failure(
                "No query or domain available for code generation.",
                "I couldn't work out what to generate code for.",
            );
        };
        let domain = match self.pipeline.registry().require(domain_name) {
            Ok(domain) => domain.clone(),
            Err(e) => return StateUpdate::failure(e.to_string(), e.to_string()),
        };

        let generation = self
            .pipeline
            .generate(query, &domain, state.prior_turns(), false)
            .await;

        match generation.final_code() {
            Some(code) => StateUpdate {
                messages: vec![ConversationTurn::assistant(format!(
                    "Here's the PyDough code for your query:\n```python\n{code}\n```"
                ))],
                generated_code: Some(code.to_string()),
                explanation: generation.explanation.clone(),
                ..StateUpdate::default()
            },
            None => {
                let error = generation
                    .error
                    .unwrap_or_else(|| PipelineError::DecodeFailure.to_string());
                StateUpdate::failure(
                    error.clone(),
                    format!(
                        "I encountered a problem generating the PyDough code for your query. Error: {error}"
                    ),
                )
            }
        }
    }

    async fn execute_code(&self, state: &QueryState) -> StateUpdate {
        let (Some(code), Some(domain_name), Some(query)) = (
            state.generated_code.as_deref(),
            state.domain.as_deref(),
            state.latest_user_query(),
        ) else {
            return StateUpdate::failure(
                "No generated code, domain or query available for execution.",
                "I couldn't execute anything because no PyDough code was generated for this query.",
            );
        };
        let domain = match self.pipeline.registry().require(domain_name) {
            Ok(domain) => domain.clone(),
            Err(e) => return StateUpdate::failure(e.to_string(), e.to_string()),
        };

        let at = Utc::now();
        let run = self.pipeline.run_code(code, &domain, query, at, true).await;
        let Some(outcome) = run.outcome else {
            return StateUpdate::failure(
                "Failed to adapt and execute code",
                "I couldn't execute the generated code. There might be an issue with adapting it for execution.",
            );
        };

        if self.pipeline.should_save(None) {
            let base = base_name(&domain.name, query, at);
            self.pipeline.store().save_execution(&base, &outcome).await;
        }

        StateUpdate {
            messages: vec![ConversationTurn::assistant(describe_outcome(&outcome))],
            execution: Some(outcome),
            ..StateUpdate::default()
        }
    }
}

fn describe_outcome(outcome: &ExecutionOutcome) -> String {
    if !outcome.success() {
        return format!(
            "Execution failed: {}",
            outcome.error().unwrap_or("Unknown error")
        );
    }
    match outcome.output().filter(|o| !o.trim().is_empty()) {
        Some(output) if output.contains("SQL Query:") && output.contains("Result:") => {
            format!("Execution successful!\n\n{output}")
        }
        Some(output) => format!("Execution successful!\n\nRaw output:\n{output}"),
        None => "Execution successful!\n\nNo specific result data found in execution output."
            .to_string(),
    }
}
