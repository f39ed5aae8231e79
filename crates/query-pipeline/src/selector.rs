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

use async_trait::async_trait;
use llm_contracts::{GenerationConfig, ProviderRequest, ProviderResponse};
use llm_providers::ApiClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::domains::{Domain, DomainRegistry};
use crate::error::{PipelineError, PipelineResult};
use crate::prompt::build_classification_prompt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SelectionMethod {
    Forced,
    Classifier {
        confidence: Option<f64>,
        reasoning: Option<String>,
    },
    Keyword {
        score: usize,
    },
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainSelection {
    pub domain: Domain,
    pub method: SelectionMethod,
}

/// A classifier's raw answer; the name may not be registered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Classification {
    pub domain: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait DomainClassifier: Send + Sync {
    async fn classify(&self, query: &str, registry: &DomainRegistry)
        -> PipelineResult<Classification>;
}

/// Asks the generative model to name the domain.
pub struct ModelDomainClassifier {
    client: Arc<dyn ApiClient>,
    model: String,
    generation: GenerationConfig,
}

impl ModelDomainClassifier {
    pub fn new(client: Arc<dyn ApiClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            generation: GenerationConfig {
                temperature: Some(0.01),
                ..GenerationConfig::default()
            },
        }
    }

    fn response_schema(registry: &DomainRegistry) -> Value {
        json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string", "enum": registry.names() },
                "confidence": { "type": "number" },
                "reasoning": { "type": "string" }
            },
            "required": ["domain"]
        })
    }
}

fn parse_classification(response: &ProviderResponse) -> Option<Classification> {
    let from_json = |text: &str| serde_json::from_str::<Classification>(text.trim()).ok();

    if let Some(parsed) = from_json(&response.content) {
        return Some(parsed);
    }
    if let Some(structured) = &response.structured {
        let parsed = match structured {
            Value::String(text) => from_json(text),
            other => serde_json::from_value(other.clone()).ok(),
        };
        if parsed.is_some() {
            return parsed;
        }
    }
    if let Some(start) = response.content.find('{') {
        let mut stream = serde_json::Deserializer::from_str(&response.content[start..])
            .into_iter::<Classification>();
        if let Some(Ok(parsed)) = stream.next() {
            return Some(parsed);
        }
    }

    // A bare name, possibly quoted or followed by punctuation.
    let bare = response
        .content
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.');
    if bare.is_empty() || bare.contains(char::is_whitespace) {
        return None;
    }
    Some(Classification {
        domain: bare.to_string(),
        confidence: None,
        reasoning: None,
    })
}

#[async_trait]
impl DomainClassifier for ModelDomainClassifier {
    async fn classify(
        &self,
        query: &str,
        registry: &DomainRegistry,
    ) -> PipelineResult<Classification> {
        let request = ProviderRequest::from_prompt(
            &self.model,
            build_classification_prompt(query, registry),
            &self.generation,
        )
        .with_response_schema(Self::response_schema(registry));

        let response = self
            .client
            .send_request(request)
            .await
            .map_err(|e| PipelineError::ClassificationFailure(e.to_string()))?;

        parse_classification(&response).ok_or_else(|| {
            PipelineError::ClassificationFailure(format!(
                "unrecognised classifier reply: {}",
                response.content.chars().take(120).collect::<String>()
            ))
        })
    }
}

/// Keyword hit count per domain, in registry order.
pub fn keyword_scores<'a>(query: &str, registry: &'a DomainRegistry) -> Vec<(&'a Domain, usize)> {
    let query_lower = query.to_lowercase();
    registry
        .iter()
        .map(|domain| {
            let score = domain
                .keywords
                .iter()
                .filter(|k| query_lower.contains(&k.to_lowercase()))
                .count();
            (domain, score)
        })
        .collect()
}

/// Highest keyword score wins, earlier registration breaks ties, no hits
/// falls back to the registry default.
pub fn select_by_keywords(query: &str, registry: &DomainRegistry) -> DomainSelection {
    let mut best: Option<(&Domain, usize)> = None;
    for (domain, score) in keyword_scores(query, registry) {
        if score > best.map_or(0, |(_, s)| s) {
            best = Some((domain, score));
        }
    }

    match best {
        Some((domain, score)) => DomainSelection {
            domain: domain.clone(),
            method: SelectionMethod::Keyword { score },
        },
        None => DomainSelection {
            domain: registry.default_domain().clone(),
            method: SelectionMethod::Default,
        },
    }
}

pub struct DomainSelector {
    registry: Arc<DomainRegistry>,
    classifier: Option<Arc<dyn DomainClassifier>>,
    timeout: Duration,
}

impl DomainSelector {
    pub fn new(
        registry: Arc<DomainRegistry>,
        classifier: Option<Arc<dyn DomainClassifier>>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            classifier,
            timeout,
        }
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    /// Picks the domain for `query`.
    ///
    /// Only an unregistered forced domain is an error; every classifier
    /// problem degrades to keyword scoring.
    #[instrument(skip(self, query), fields(query_len = query.len(), forced = forced.unwrap_or("")))]
    pub async fn select(&self, query: &str, forced: Option<&str>) -> PipelineResult<DomainSelection> {
        if let Some(name) = forced {
            let domain = self.registry.require(name)?;
            info!(domain = %domain.name, "Using forced domain");
            return Ok(DomainSelection {
                domain: domain.clone(),
                method: SelectionMethod::Forced,
            });
        }

        match self.classify(query).await {
            Ok(selection) => Ok(selection),
            Err(e) => {
                warn!(error = %e, "Falling back to keyword domain detection");
                let selection = select_by_keywords(query, &self.registry);
                info!(domain = %selection.domain.name, method = ?selection.method, "Detected domain by keywords");
                Ok(selection)
            }
        }
    }

    async fn classify(&self, query: &str) -> PipelineResult<DomainSelection> {
        let classifier = self.classifier.as_ref().ok_or_else(|| {
            PipelineError::ClassificationFailure("no classifier configured".to_string())
        })?;

        let classification =
            tokio::time::timeout(self.timeout, classifier.classify(query, &self.registry))
                .await
                .map_err(|_| {
                    PipelineError::ClassificationFailure(format!(
                        "classifier timed out after {:?}",
                        self.timeout
                    ))
                })??;

        let domain = self.registry.resolve(&classification.domain).ok_or_else(|| {
            PipelineError::ClassificationFailure(format!(
                "classifier returned unknown domain '{}'",
                classification.domain
            ))
        })?;

        debug!(reasoning = ?classification.reasoning, "Classifier reasoning");
        info!(domain = %domain.name, confidence = ?classification.confidence, "Detected domain by classifier");
        Ok(DomainSelection {
            domain: domain.clone(),
            method: SelectionMethod::Classifier {
                confidence: classification.confidence,
                reasoning: classification.reasoning,
            },
        })
    }
}
