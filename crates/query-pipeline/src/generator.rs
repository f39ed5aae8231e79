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

use std::sync::Arc;
use std::time::Duration;

use llm_contracts::{GenerationConfig, LLMError, ProviderRequest, ProviderResponse};
use llm_providers::ApiClient;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::decoder::{decode, ensure_result_assignment, fenced_block, DecodedResponse};
use crate::error::{PipelineError, PipelineResult};
use crate::prompt::build_review_prompt;
use crate::types::GenerationResult;

fn code_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "code": { "type": "string" },
            "explanation": { "type": "string" }
        },
        "required": ["code"]
    })
}

fn review_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "reviewed_code": { "type": "string" } },
        "required": ["reviewed_code"]
    })
}

async fn send_bounded(
    client: &dyn ApiClient,
    request: ProviderRequest,
    timeout: Duration,
) -> PipelineResult<ProviderResponse> {
    match tokio::time::timeout(timeout, client.send_request(request)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(PipelineError::Model(LLMError::Timeout)),
    }
}

/// Sends generation prompts and decodes the replies.
pub struct CodeGenerator {
    client: Arc<dyn ApiClient>,
    model: String,
    generation: GenerationConfig,
    timeout: Duration,
}

impl CodeGenerator {
    pub fn new(
        client: Arc<dyn ApiClient>,
        model: impl Into<String>,
        generation: GenerationConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            generation,
            timeout,
        }
    }

    /// A model failure is reported on the result, not raised.
    #[instrument(skip(self, prompt), fields(domain = %domain, model = %self.model, prompt_len = prompt.len()))]
    pub async fn generate(&self, prompt: &str, domain: &str) -> GenerationResult {
        let request = ProviderRequest::from_prompt(&self.model, prompt, &self.generation)
            .with_response_schema(code_schema());

        let response = match send_bounded(self.client.as_ref(), request, self.timeout).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Code generation request failed");
                return GenerationResult {
                    domain: domain.to_string(),
                    code: None,
                    explanation: None,
                    transcript: String::new(),
                    tier: None,
                    reviewed_code: None,
                    error: Some(format!("Error generating PyDough code: {e}")),
                };
            }
        };

        let DecodedResponse {
            code,
            explanation,
            tier,
        } = decode(&response);

        match &code {
            Some(_) => info!(tier = ?tier, "Received PyDough code from model"),
            None => warn!("No PyDough code found in the model response"),
        }

        GenerationResult {
            domain: domain.to_string(),
            error: code
                .is_none()
                .then(|| PipelineError::DecodeFailure.to_string()),
            code,
            explanation,
            transcript: response.content,
            tier,
            reviewed_code: None,
        }
    }
}

/// Optional second pass asking the model to correct generated code.
pub struct CodeReviewer {
    client: Arc<dyn ApiClient>,
    model: String,
    generation: GenerationConfig,
    timeout: Duration,
}

impl CodeReviewer {
    pub fn new(
        client: Arc<dyn ApiClient>,
        model: impl Into<String>,
        generation: GenerationConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            generation,
            timeout,
        }
    }

    /// Reviewed code, or `None` when review failed or changed nothing.
    #[instrument(skip(self, code), fields(model = %self.model))]
    pub async fn review(&self, code: &str) -> Option<String> {
        let request =
            ProviderRequest::from_prompt(&self.model, build_review_prompt(code), &self.generation)
                .with_response_schema(review_schema());

        let response = match send_bounded(self.client.as_ref(), request, self.timeout).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Code review failed; keeping original code");
                return None;
            }
        };

        let reviewed = serde_json::from_str::<Value>(response.content.trim())
            .ok()
            .or_else(|| response.structured.clone())
            .and_then(|v| v.get("reviewed_code").and_then(Value::as_str).map(str::to_string))
            .or_else(|| fenced_block(&response).map(|e| e.code))?;

        let reviewed = ensure_result_assignment(&reviewed);
        if reviewed.trim().is_empty() || reviewed == code.trim() {
            return None;
        }
        info!("Code review produced changes");
        Some(reviewed)
    }
}
