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

use std::path::{Path, PathBuf};
use std::time::Duration;

use llm_contracts::{GenerationConfig, Provider, ProviderConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// What the adapted script runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// The real query-DSL runtime, backed by the domain's SQLite database.
    #[default]
    Pydough,
    /// A canned table that needs nothing beyond the interpreter.
    Mock,
}

impl std::str::FromStr for RuntimeMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pydough" | "real" => Ok(RuntimeMode::Pydough),
            "mock" => Ok(RuntimeMode::Mock),
            other => Err(PipelineError::Configuration(format!(
                "unknown runtime mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub domains_file: Option<PathBuf>,
    pub cheatsheet_path: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub python: String,
    pub execution_timeout_secs: u64,
    pub classifier_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub runtime_mode: RuntimeMode,
    pub save_results: bool,
    /// Gate for the graph's execution node; per-request flags still apply.
    pub execution_enabled: bool,
    pub batch_concurrency: usize,
    pub codegen_model: String,
    pub classifier_model: String,
    pub review_model: String,
    pub generation: GenerationConfig,
    pub provider: ProviderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            domains_file: None,
            cheatsheet_path: Some(PathBuf::from("cheatsheet.md")),
            results_dir: PathBuf::from("results"),
            python: "python3".to_string(),
            execution_timeout_secs: 60,
            classifier_timeout_secs: 15,
            generation_timeout_secs: 120,
            runtime_mode: RuntimeMode::Pydough,
            save_results: true,
            execution_enabled: true,
            batch_concurrency: 4,
            codegen_model: "gemini-2.5-pro-preview-05-06".to_string(),
            classifier_model: "gemini-2.0-flash".to_string(),
            review_model: "gemini-2.5-pro-preview-05-06".to_string(),
            generation: GenerationConfig {
                temperature: Some(0.01),
                ..GenerationConfig::default()
            },
            provider: ProviderConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> PipelineResult<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// File (when given) then environment, on top of defaults.
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let base = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        base.apply_env(|key| std::env::var(key).ok())
    }

    /// Overrides fields from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(mut self, lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PYDOUGH_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PYDOUGH_DOMAINS_FILE") {
            self.domains_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PYDOUGH_CHEATSHEET") {
            self.cheatsheet_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PYDOUGH_RESULTS_DIR") {
            self.results_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PYDOUGH_PYTHON") {
            self.python = v;
        }
        if let Some(v) = get("PYDOUGH_EXEC_TIMEOUT_SECS") {
            self.execution_timeout_secs = parse_number("PYDOUGH_EXEC_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("PYDOUGH_CLASSIFIER_TIMEOUT_SECS") {
            self.classifier_timeout_secs = parse_number("PYDOUGH_CLASSIFIER_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("PYDOUGH_RUNTIME_MODE") {
            self.runtime_mode = v.parse()?;
        }
        if let Some(v) = get("PYDOUGH_SAVE_RESULTS") {
            self.save_results = parse_bool(&v);
        }
        if let Some(v) = get("PYDOUGH_EXECUTION_ENABLED") {
            self.execution_enabled = parse_bool(&v);
        }
        if let Some(v) = get("PYDOUGH_BATCH_CONCURRENCY") {
            self.batch_concurrency = parse_number::<usize>("PYDOUGH_BATCH_CONCURRENCY", &v)?.max(1);
        }
        if let Some(v) = get("PYDOUGH_CODEGEN_MODEL") {
            self.review_model = v.clone();
            self.codegen_model = v;
        }
        if let Some(v) = get("PYDOUGH_CLASSIFIER_MODEL") {
            self.classifier_model = v;
        }

        if let Some(v) = get("LLM_PROVIDER") {
            self.provider.provider = Provider::from(v);
        } else if get("GEMINI_API_KEY").is_some() {
            self.provider.provider = Provider::Gemini;
        } else if get("OPENAI_API_KEY").is_some() {
            self.provider.provider = Provider::OpenAI;
        }
        let key_var = match self.provider.provider {
            Provider::Gemini => Some("GEMINI_API_KEY"),
            Provider::OpenAI => Some("OPENAI_API_KEY"),
            _ => None,
        };
        if let Some(key) = key_var.and_then(get) {
            self.provider.api_key = Some(key);
        }
        if let Some(v) = get("LLM_ENDPOINT") {
            self.provider.endpoint = Some(v);
        }

        debug!(
            provider = ?self.provider.provider,
            runtime_mode = ?self.runtime_mode,
            results_dir = %self.results_dir.display(),
            "Resolved pipeline configuration"
        );
        Ok(self)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> PipelineResult<T> {
    value.trim().parse().map_err(|_| {
        PipelineError::Configuration(format!("{key} must be a number, got '{value}'"))
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
