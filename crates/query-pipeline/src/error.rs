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

use llm_contracts::LLMError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown domain '{requested}'. Known domains: {}", known.join(", "))]
    UnknownDomain {
        requested: String,
        known: Vec<String>,
    },

    #[error("Domain classification failed: {0}")]
    ClassificationFailure(String),

    #[error("No code could be decoded from the model response")]
    DecodeFailure,

    #[error("Execution timed out after {0} seconds")]
    ExecutionTimeout(u64),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Failed to persist artifact {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("Model error: {0}")]
    Model(#[from] LLMError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Configuration(format!("invalid YAML: {err}"))
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::Configuration(format!("invalid TOML: {err}"))
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Configuration(format!("invalid query file: {err}"))
    }
}
