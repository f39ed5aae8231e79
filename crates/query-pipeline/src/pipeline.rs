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

//! Single-shot orchestration: select, prompt, generate, adapt, execute, persist.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use llm_providers::ApiClient;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{AdaptedScript, CodeAdapter};
use crate::artifacts::{base_name, script_file_name, ArtifactSet, ArtifactStore};
use crate::config::PipelineConfig;
use crate::domains::{read_schema_doc, Domain, DomainRegistry};
use crate::executor::{ExecutionOutcome, FailureContext, SandboxedExecutor};
use crate::generator::{CodeGenerator, CodeReviewer};
use crate::prompt::{build_prompt, load_cheatsheet};
use crate::selector::{DomainClassifier, DomainSelection, DomainSelector, ModelDomainClassifier};
use crate::types::{ConversationTurn, GenerationResult, QueryRequest, QueryResponse};

const NO_MODEL: &str = "No generative model is configured; set LLM_PROVIDER and an API key";

/// Result of running an existing script file.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRun {
    pub script_path: PathBuf,
    pub outcome: ExecutionOutcome,
    pub artifacts: ArtifactSet,
}

/// Script adaptation followed by an optional run.
#[derive(Debug, Clone)]
pub struct CodeRun {
    pub script: Option<AdaptedScript>,
    pub outcome: Option<ExecutionOutcome>,
}

pub struct QueryPipeline {
    config: PipelineConfig,
    registry: Arc<DomainRegistry>,
    selector: DomainSelector,
    generator: Option<CodeGenerator>,
    reviewer: Option<CodeReviewer>,
    adapter: CodeAdapter,
    executor: SandboxedExecutor,
    store: ArtifactStore,
    cheatsheet: String,
}

impl QueryPipeline {
    /// Without a model client, domain selection falls back to keywords and
    /// generation reports an error on every request.
    pub fn new(
        config: PipelineConfig,
        registry: Arc<DomainRegistry>,
        client: Option<Arc<dyn ApiClient>>,
    ) -> Self {
        let classifier = client.clone().map(|c| {
            Arc::new(ModelDomainClassifier::new(c, config.classifier_model.clone()))
                as Arc<dyn DomainClassifier>
        });
        let selector =
            DomainSelector::new(registry.clone(), classifier, config.classifier_timeout());

        let generator = client.clone().map(|c| {
            CodeGenerator::new(
                c,
                config.codegen_model.clone(),
                config.generation.clone(),
                config.generation_timeout(),
            )
        });
        let reviewer = client.map(|c| {
            CodeReviewer::new(
                c,
                config.review_model.clone(),
                config.generation.clone(),
                config.generation_timeout(),
            )
        });

        let adapter = CodeAdapter::new(config.results_dir.clone(), config.runtime_mode);
        let executor =
            SandboxedExecutor::new(config.python.clone(), config.execution_timeout());
        let store = ArtifactStore::new(config.results_dir.clone());
        let cheatsheet = load_cheatsheet(config.cheatsheet_path.as_deref());

        info!(
            domains = registry.len(),
            model = generator.is_some(),
            runtime_mode = ?config.runtime_mode,
            results_dir = %config.results_dir.display(),
            "Query pipeline ready"
        );

        Self {
            config,
            registry,
            selector,
            generator,
            reviewer,
            adapter,
            executor,
            store,
            cheatsheet,
        }
    }

    /// Replaces the domain classifier; `None` leaves keyword scoring only.
    pub fn with_classifier(mut self, classifier: Option<Arc<dyn DomainClassifier>>) -> Self {
        self.selector = DomainSelector::new(
            self.registry.clone(),
            classifier,
            self.config.classifier_timeout(),
        );
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn has_model(&self) -> bool {
        self.generator.is_some()
    }

    pub fn should_save(&self, request_override: Option<bool>) -> bool {
        request_override.unwrap_or(self.config.save_results)
    }

    pub async fn select_domain(
        &self,
        query: &str,
        forced: Option<&str>,
    ) -> crate::error::PipelineResult<DomainSelection> {
        self.selector.select(query, forced).await
    }

    /// Builds the prompt and asks the model, reviewing when requested.
    pub async fn generate(
        &self,
        query: &str,
        domain: &Domain,
        history: &[ConversationTurn],
        review: bool,
    ) -> GenerationResult {
        let Some(generator) = &self.generator else {
            warn!("Generation requested without a model client");
            return GenerationResult {
                domain: domain.name.clone(),
                code: None,
                explanation: None,
                transcript: String::new(),
                tier: None,
                reviewed_code: None,
                error: Some(NO_MODEL.to_string()),
            };
        };

        let schema_doc = read_schema_doc(domain);
        let prompt = build_prompt(query, domain, &schema_doc, &self.cheatsheet, history);
        let mut generation = generator.generate(&prompt, &domain.name).await;

        if review {
            if let (Some(reviewer), Some(code)) = (&self.reviewer, generation.code.as_deref()) {
                generation.reviewed_code = reviewer.review(code).await;
            }
        }
        generation
    }

    /// Writes the script for `code` and runs it when `execute` is set.
    pub async fn run_code(
        &self,
        code: &str,
        domain: &Domain,
        query: &str,
        at: DateTime<Utc>,
        execute: bool,
    ) -> CodeRun {
        let script_name = script_file_name(&domain.name, query, at);
        let script = match self.adapter.adapt(code, domain, &script_name).await {
            Ok(script) => Some(script),
            Err(e) => {
                warn!(error = %e, "Failed to write adapted script");
                if execute {
                    return CodeRun {
                        script: None,
                        outcome: Some(ExecutionOutcome::failed(
                            format!("Failed to write script {script_name}: {e}"),
                            FailureContext::default(),
                            Duration::ZERO,
                        )),
                    };
                }
                None
            }
        };

        let outcome = match (&script, execute) {
            (Some(script), true) => Some(self.executor.execute(&script.path).await),
            _ => None,
        };
        CodeRun { script, outcome }
    }

    #[instrument(
        skip(self, request),
        fields(query_len = request.query_text.len(), forced = ?request.domain, execute = request.execute)
    )]
    pub async fn process(&self, request: QueryRequest) -> QueryResponse {
        let started_at = Utc::now();
        let save = self.should_save(request.save_results);
        let mut response = QueryResponse {
            id: Uuid::new_v4().to_string(),
            query: request.query_text.clone(),
            success: false,
            domain: None,
            pydough_code: None,
            explanation: None,
            timestamp: started_at,
            reviewed_code: None,
            decode_tier: None,
            llm_response: None,
            adapted_code: None,
            output_file: None,
            execution: None,
            sql: None,
            error: None,
            artifacts: None,
        };

        let selection = match self
            .select_domain(&request.query_text, request.domain.as_deref())
            .await
        {
            Ok(selection) => selection,
            Err(e) => {
                warn!(error = %e, "Domain selection failed");
                response.error = Some(e.to_string());
                return response;
            }
        };
        let domain = selection.domain;
        response.domain = Some(domain.name.clone());

        let generation = self
            .generate(&request.query_text, &domain, &request.history, request.review)
            .await;
        response.llm_response = Some(generation.transcript.clone()).filter(|t| !t.is_empty());
        response.explanation = generation.explanation.clone();
        response.decode_tier = generation.tier;
        response.reviewed_code = generation.reviewed_code.clone();
        response.pydough_code = generation.code.clone();

        let base = base_name(&domain.name, &request.query_text, started_at);
        let Some(code) = generation.final_code() else {
            response.error = generation.error.clone();
            if save {
                self.persist_record(&base, &mut response, ArtifactSet::default())
                    .await;
            }
            return response;
        };

        let run = self
            .run_code(code, &domain, &request.query_text, started_at, request.execute)
            .await;
        let mut artifacts = ArtifactSet::default();
        if let Some(script) = &run.script {
            response.adapted_code = Some(script.text.clone());
            response.output_file = Some(script.path.display().to_string());
            artifacts.script_path = Some(script.path.clone());
        }

        response.success = match &run.outcome {
            None => true,
            Some(outcome) => {
                response.sql = outcome.sql().map(str::to_string);
                if !outcome.success() {
                    response.error = outcome.error().map(str::to_string);
                }
                if save {
                    let saved = self.store.save_execution(&base, outcome).await;
                    artifacts.sql_path = saved.sql_path;
                    artifacts.output_path = saved.output_path;
                    artifacts.error_path = saved.error_path;
                }
                outcome.success()
            }
        };
        response.execution = run.outcome;

        if save {
            self.persist_record(&base, &mut response, artifacts).await;
        } else {
            response.artifacts = artifacts.script_path.is_some().then_some(artifacts);
        }

        info!(
            id = %response.id,
            domain = %domain.name,
            success = response.success,
            executed = response.execution.is_some(),
            "Processed query"
        );
        response
    }

    async fn persist_record(&self, base: &str, response: &mut QueryResponse, mut artifacts: ArtifactSet) {
        artifacts.summary_path = Some(self.store.record_path(base));
        response.artifacts = Some(artifacts);
        if self.store.save_record(base, response).await.is_none() {
            if let Some(set) = response.artifacts.as_mut() {
                set.summary_path = None;
            }
        }
    }

    /// Runs an existing script. Artifacts reuse the script's own name when it
    /// was written by this pipeline, otherwise a `runfile_` name.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn run_script(&self, path: &Path) -> ScriptRun {
        let outcome = self.executor.execute(path).await;
        let mut artifacts = ArtifactSet {
            script_path: Some(path.to_path_buf()),
            ..ArtifactSet::default()
        };

        if self.config.save_results {
            let base = run_file_base(path);
            let saved = self.store.save_execution(&base, &outcome).await;
            artifacts.sql_path = saved.sql_path;
            artifacts.output_path = saved.output_path;
            artifacts.error_path = saved.error_path;
        }

        ScriptRun {
            script_path: path.to_path_buf(),
            outcome,
            artifacts,
        }
    }
}

fn run_file_base(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("script");
    match stem.split_once("_query_") {
        Some((domain, rest)) if !domain.is_empty() && !rest.is_empty() => {
            format!("{domain}_{rest}")
        }
        _ => format!("runfile_{stem}"),
    }
}
