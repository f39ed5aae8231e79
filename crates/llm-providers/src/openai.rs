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

use async_trait::async_trait;
use llm_contracts::{LLMError, LLMResult, ProviderRequest, ProviderResponse, Usage};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::retry::{build_http_client, post_json_with_retry};
use crate::ApiClient;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    endpoint: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAIClient {
    pub fn new(
        api_key: String,
        endpoint: Option<String>,
        timeout_seconds: Option<u32>,
        max_retries: Option<u32>,
    ) -> LLMResult<Self> {
        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(30).into());

        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            endpoint: endpoint
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            timeout,
            max_retries: max_retries.unwrap_or(3),
        })
    }

    fn build_openai_payload(&self, request: &ProviderRequest) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages.iter().map(|msg| {
                json!({
                    "role": msg.role,
                    "content": msg.content
                })
            }).collect::<Vec<_>>()
        });

        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop_sequences {
            payload["stop"] = json!(stop);
        }
        if let Some(schema) = &request.response_schema {
            payload["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "schema": schema }
            });
        }

        for (key, value) in &request.provider_specific {
            payload[key] = value.clone();
        }

        payload
    }

    fn parse_openai_response(
        &self,
        response_data: Value,
        model: String,
    ) -> LLMResult<ProviderResponse> {
        let content = response_data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                LLMError::Provider("Failed to extract content from OpenAI response".to_string())
            })?;

        let usage = if let Some(usage_data) = response_data.get("usage") {
            Usage {
                prompt_tokens: usage_data["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage_data["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage_data["total_tokens"].as_u64().unwrap_or(0) as u32,
            }
        } else {
            Usage::default()
        };

        let finish_reason = response_data["choices"][0]["finish_reason"]
            .as_str()
            .map(|s| s.to_string());

        Ok(ProviderResponse {
            content: content.to_string(),
            model,
            usage,
            finish_reason,
            structured: None,
            raw_response: response_data,
        })
    }
}

#[async_trait]
impl ApiClient for OpenAIClient {
    async fn send_request(&self, request: ProviderRequest) -> LLMResult<ProviderResponse> {
        let payload = self.build_openai_payload(&request);
        let response_data = post_json_with_retry(
            &self.client,
            &self.endpoint,
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &payload,
            self.timeout,
            self.max_retries,
            self.provider_name(),
        )
        .await?;
        self.parse_openai_response(response_data, request.model)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }

    async fn health_check(&self) -> LLMResult<()> {
        let test_request = ProviderRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![llm_contracts::Message::user("Hi")],
            max_tokens: Some(10),
            temperature: Some(0.1),
            top_p: None,
            stop_sequences: None,
            response_schema: None,
            provider_specific: std::collections::HashMap::new(),
        };

        self.send_request(test_request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_contracts::GenerationConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_request_parses_chat_completion() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "{\"code\": \"result = Nations\"}"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(
            "sk-test".into(),
            Some(format!("{}/v1/chat/completions", mock_server.uri())),
            Some(5),
            Some(1),
        )
        .unwrap();

        let request =
            ProviderRequest::from_prompt("gpt-4o-mini", "list nations", &GenerationConfig::default())
                .with_response_schema(json!({"type": "object"}));
        let response = client.send_request(request).await.unwrap();

        assert_eq!(response.content, "{\"code\": \"result = Nations\"}");
        assert_eq!(response.usage.total_tokens, 20);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client =
            OpenAIClient::new("sk-test".into(), Some(mock_server.uri()), Some(5), Some(3)).unwrap();
        let request =
            ProviderRequest::from_prompt("gpt-4o-mini", "hi", &GenerationConfig::default());

        let err = client.send_request(request).await.unwrap_err();
        assert!(matches!(err, LLMError::Provider(msg) if msg.contains("bad request")));
    }

    #[test]
    fn test_payload_includes_response_format() {
        let client = OpenAIClient::new("k".into(), None, None, None).unwrap();
        let request = ProviderRequest::from_prompt("m", "p", &GenerationConfig::default())
            .with_response_schema(json!({"type": "object"}));
        let payload = client.build_openai_payload(&request);
        assert_eq!(payload["response_format"]["type"], "json_schema");
        assert_eq!(payload["messages"][0]["content"], "p");
    }
}
