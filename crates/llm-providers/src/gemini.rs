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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Client for the Gemini `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        timeout_seconds: Option<u32>,
        max_retries: Option<u32>,
    ) -> LLMResult<Self> {
        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(60).into());

        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout,
            max_retries: max_retries.unwrap_or(3),
        })
    }

    fn endpoint_for(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }

    fn build_gemini_payload(&self, request: &ProviderRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in &request.messages {
            match msg.role.as_str() {
                "system" => system_parts.push(json!({ "text": msg.content })),
                role => contents.push(json!({
                    "role": if role == "assistant" { "model" } else { "user" },
                    "parts": [{ "text": msg.content }]
                })),
            }
        }

        let mut payload = json!({ "contents": contents });
        if !system_parts.is_empty() {
            payload["systemInstruction"] = json!({ "parts": system_parts });
        }

        let mut generation_config = json!({});
        if let Some(max_tokens) = request.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            generation_config["topP"] = json!(top_p);
        }
        if let Some(stop) = &request.stop_sequences {
            generation_config["stopSequences"] = json!(stop);
        }
        if let Some(schema) = &request.response_schema {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = schema.clone();
        }
        payload["generationConfig"] = generation_config;

        for (key, value) in &request.provider_specific {
            payload[key] = value.clone();
        }

        payload
    }

    fn parse_gemini_response(
        &self,
        response_data: Value,
        model: String,
    ) -> LLMResult<ProviderResponse> {
        let candidate = &response_data["candidates"][0];
        let parts = candidate["content"]["parts"].as_array().ok_or_else(|| {
            LLMError::Provider("Failed to extract content from Gemini response".to_string())
        })?;

        let content = parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .join("");

        let usage = response_data
            .get("usageMetadata")
            .map(|u| Usage {
                prompt_tokens: u["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                completion_tokens: u["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                total_tokens: u["totalTokenCount"].as_u64().unwrap_or(0) as u32,
            })
            .unwrap_or_default();

        // Mirrors the SDK's parsed accessor: only set when the text is a JSON value.
        let structured = serde_json::from_str::<Value>(content.trim()).ok();

        Ok(ProviderResponse {
            content,
            model,
            usage,
            finish_reason: candidate["finishReason"].as_str().map(str::to_string),
            structured,
            raw_response: response_data,
        })
    }
}

#[async_trait]
impl ApiClient for GeminiClient {
    async fn send_request(&self, request: ProviderRequest) -> LLMResult<ProviderResponse> {
        let payload = self.build_gemini_payload(&request);
        let response_data = post_json_with_retry(
            &self.client,
            &self.endpoint_for(&request.model),
            &[("x-goog-api-key", self.api_key.clone())],
            &payload,
            self.timeout,
            self.max_retries,
            self.provider_name(),
        )
        .await?;
        self.parse_gemini_response(response_data, request.model)
    }

    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    async fn health_check(&self) -> LLMResult<()> {
        let test_request = ProviderRequest {
            model: "gemini-2.0-flash".to_string(),
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
    use llm_contracts::{GenerationConfig, Message};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gemini_body(text: &str) -> Value {
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 10, "totalTokenCount": 50}
        })
    }

    #[tokio::test]
    async fn test_send_request_sets_structured_when_json() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(gemini_body(r#"{"code": "result = Nations", "explanation": "all"}"#)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client =
            GeminiClient::new("g-key".into(), Some(mock_server.uri()), Some(5), Some(1)).unwrap();
        let request =
            ProviderRequest::from_prompt("gemini-2.0-flash", "nations", &GenerationConfig::default());
        let response = client.send_request(request).await.unwrap();

        assert_eq!(response.usage.total_tokens, 50);
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(
            response.structured.unwrap()["code"],
            json!("result = Nations")
        );
    }

    #[tokio::test]
    async fn test_plain_text_has_no_structured_payload() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(gemini_body("Broker")))
            .mount(&mock_server)
            .await;

        let client =
            GeminiClient::new("g-key".into(), Some(mock_server.uri()), Some(5), Some(1)).unwrap();
        let request = ProviderRequest::from_prompt("m", "which domain", &GenerationConfig::default());
        let response = client.send_request(request).await.unwrap();

        assert_eq!(response.content, "Broker");
        assert!(response.structured.is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client =
            GeminiClient::new("bad".into(), Some(mock_server.uri()), Some(5), Some(3)).unwrap();
        let request = ProviderRequest::from_prompt("m", "p", &GenerationConfig::default());

        let err = client.send_request(request).await.unwrap_err();
        assert!(matches!(err, LLMError::Authentication(_)));
    }

    #[test]
    fn test_payload_maps_roles_and_schema() {
        let client = GeminiClient::new("k".into(), None, None, None).unwrap();
        let mut request = ProviderRequest::from_prompt("m", "question", &GenerationConfig::default())
            .with_response_schema(json!({"type": "object"}));
        request.messages.insert(0, Message::system("be terse"));

        let payload = client.build_gemini_payload(&request);
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }
}
