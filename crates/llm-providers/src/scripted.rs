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

//! Offline client that replays canned replies.
//!
//! Used for mock runs without credentials and by the pipeline tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use llm_contracts::{LLMError, LLMResult, ProviderRequest, ProviderResponse};

use crate::ApiClient;

#[derive(Debug)]
pub struct ScriptedClient {
    queue: Mutex<VecDeque<LLMResult<ProviderResponse>>>,
    fallback: Option<ProviderResponse>,
    delay: Option<Duration>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedClient {
    /// Replies are returned in order; once exhausted every call fails.
    pub fn new(replies: Vec<LLMResult<ProviderResponse>>) -> Self {
        Self {
            queue: Mutex::new(replies.into()),
            fallback: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the same reply.
    pub fn repeating(reply: ProviderResponse) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|t| Ok(ProviderResponse::from_text(t, "scripted")))
                .collect(),
        )
    }

    /// Sleeps before answering, for exercising caller timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ApiClient for ScriptedClient {
    async fn send_request(&self, request: ProviderRequest) -> LLMResult<ProviderResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.requests
            .lock()
            .map_err(|_| LLMError::Internal("request log poisoned".to_string()))?
            .push(request);

        let next = self
            .queue
            .lock()
            .map_err(|_| LLMError::Internal("reply queue poisoned".to_string()))?
            .pop_front();

        match (next, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(reply)) => Ok(reply.clone()),
            (None, None) => Err(LLMError::Provider("scripted replies exhausted".to_string())),
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    async fn health_check(&self) -> LLMResult<()> {
        Ok(())
    }
}
