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

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactSet;
use crate::decoder::DecodeTier;
use crate::executor::ExecutionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_text: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub execute: bool,
    #[serde(default)]
    pub review: bool,
    /// Overrides the configured persistence switch when set.
    #[serde(default)]
    pub save_results: Option<bool>,
}

impl QueryRequest {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            domain: None,
            history: Vec::new(),
            execute: false,
            review: false,
            save_results: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn executing(mut self, execute: bool) -> Self {
        self.execute = execute;
        self
    }

    pub fn reviewed(mut self, review: bool) -> Self {
        self.review = review;
        self
    }

    pub fn saving(mut self, save: bool) -> Self {
        self.save_results = Some(save);
        self
    }
}

/// Outcome of asking the model for code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub domain: String,
    pub code: Option<String>,
    pub explanation: Option<String>,
    /// Raw model text, kept for debugging.
    pub transcript: String,
    pub tier: Option<DecodeTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationResult {
    /// Code after review, when review produced something different.
    pub fn final_code(&self) -> Option<&str> {
        self.reviewed_code.as_deref().or(self.code.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: String,
    pub query: String,
    pub success: bool,
    pub domain: Option<String>,
    pub pydough_code: Option<String>,
    pub explanation: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_tier: Option<DecodeTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapted_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactSet>,
}
