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

use std::time::Duration;

use llm_contracts::{LLMError, LLMResult};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

/// POSTs `payload` to `endpoint`, retrying network failures, timeouts, 429s
/// and server errors with exponential backoff. Other client errors fail fast.
pub(crate) async fn post_json_with_retry(
    client: &Client,
    endpoint: &str,
    headers: &[(&str, String)],
    payload: &Value,
    timeout: Duration,
    max_retries: u32,
    provider: &str,
) -> LLMResult<Value> {
    let mut last_error = None;
    let attempts = max_retries.max(1);

    for attempt in 0..attempts {
        let mut builder = client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(payload);
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }

        match tokio::time::timeout(timeout, builder.send()).await {
            Ok(Ok(response)) => match response.status() {
                status if status.is_success() => {
                    return response.json().await.map_err(|e| {
                        LLMError::Serialisation(format!("Failed to parse response: {e}"))
                    });
                }
                status => {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    warn!(provider, %status, attempt, "Provider returned an error status");

                    last_error = Some(match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            LLMError::Authentication(format!("{provider} API error {status}: {body}"))
                        }
                        StatusCode::TOO_MANY_REQUESTS => LLMError::RateLimit,
                        _ => LLMError::Provider(format!("{provider} API error {status}: {body}")),
                    });

                    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                        break;
                    }
                }
            },
            Ok(Err(e)) => {
                debug!(provider, attempt, error = %e, "Request failed");
                last_error = Some(LLMError::Network(format!("Request failed: {e}")));
            }
            Err(_) => {
                debug!(provider, attempt, "Request timed out");
                last_error = Some(LLMError::Timeout);
            }
        }

        if attempt + 1 < attempts {
            let wait_time = Duration::from_millis(250 * 2_u64.pow(attempt.min(4)));
            tokio::time::sleep(wait_time).await;
        }
    }

    Err(last_error.unwrap_or_else(|| LLMError::Internal("Unknown error".to_string())))
}

pub(crate) fn build_http_client(timeout: Duration) -> LLMResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LLMError::Configuration(format!("Failed to create HTTP client: {e}")))
}
