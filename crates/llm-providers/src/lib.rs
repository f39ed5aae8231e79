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

pub mod gemini;
pub mod openai;
mod retry;
pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use llm_contracts::{LLMError, LLMResult, Provider, ProviderConfig, ProviderRequest, ProviderResponse};

#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn send_request(&self, request: ProviderRequest) -> LLMResult<ProviderResponse>;

    fn provider_name(&self) -> &'static str;

    async fn health_check(&self) -> LLMResult<()>;
}

pub use gemini::GeminiClient;
pub use openai::OpenAIClient;
pub use scripted::ScriptedClient;

/// Builds the client named by `config`, or `None` when no provider is configured.
pub fn build_client(config: &ProviderConfig) -> LLMResult<Option<Arc<dyn ApiClient>>> {
    if !config.is_configured() {
        return Ok(None);
    }
    let api_key = config.api_key.clone().unwrap_or_default();

    let client: Arc<dyn ApiClient> = match &config.provider {
        Provider::Gemini => Arc::new(GeminiClient::new(
            api_key,
            config.endpoint.clone(),
            Some(config.timeout_seconds),
            Some(config.max_retries),
        )?),
        Provider::OpenAI => Arc::new(OpenAIClient::new(
            api_key,
            config.endpoint.clone(),
            Some(config.timeout_seconds),
            Some(config.max_retries),
        )?),
        Provider::None => return Ok(None),
        Provider::Custom(name) => {
            return Err(LLMError::Configuration(format!(
                "Unsupported provider '{name}'"
            )))
        }
    };
    Ok(Some(client))
}
