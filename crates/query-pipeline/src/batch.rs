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

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, span, Instrument, Level};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::QueryPipeline;
use crate::types::{QueryRequest, QueryResponse};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchQuery {
    pub category: Option<String>,
    pub query: String,
}

/// Reads `Category`/`Query` rows. Header names are matched
/// case-insensitively and only the query column is required.
pub fn parse_queries<R: Read>(reader: R, category: Option<&str>) -> PipelineResult<Vec<BatchQuery>> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = csv.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let query_col = column("query").ok_or_else(|| {
        PipelineError::Configuration("query file has no 'Query' column".to_string())
    })?;
    let category_col = column("category");

    let mut queries = Vec::new();
    for record in csv.records() {
        let record = record?;
        let Some(query) = record.get(query_col).filter(|q| !q.is_empty()) else {
            continue;
        };
        let row_category = category_col
            .and_then(|i| record.get(i))
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        if let Some(wanted) = category {
            let matches = row_category
                .as_deref()
                .map(|c| c.eq_ignore_ascii_case(wanted))
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }
        queries.push(BatchQuery {
            category: row_category,
            query: query.to_string(),
        });
    }
    Ok(queries)
}

pub fn load_queries(path: impl AsRef<Path>, category: Option<&str>) -> PipelineResult<Vec<BatchQuery>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| {
        PipelineError::Configuration(format!("cannot open {}: {e}", path.display()))
    })?;
    let queries = parse_queries(file, category)?;
    info!(path = %path.display(), count = queries.len(), category = ?category, "Loaded batch queries");
    Ok(queries)
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub domain: Option<String>,
    pub execute: bool,
    pub review: bool,
    pub save_results: Option<bool>,
    /// Falls back to the configured batch concurrency.
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful_generation: usize,
    pub successful_execution: usize,
    pub failed: usize,
    pub timestamp: DateTime<Utc>,
}

impl BatchSummary {
    pub fn from_results(results: &[QueryResponse], timestamp: DateTime<Utc>) -> Self {
        Self {
            total: results.len(),
            successful_generation: results.iter().filter(|r| r.pydough_code.is_some()).count(),
            successful_execution: results
                .iter()
                .filter(|r| r.execution.as_ref().map(|e| e.success()).unwrap_or(false))
                .count(),
            failed: results.iter().filter(|r| !r.success).count(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<QueryResponse>,
    pub summary: BatchSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<PathBuf>,
}

impl QueryPipeline {
    /// Runs every query, keeping at most `concurrency` requests in flight.
    /// Results come back in input order.
    pub async fn process_batch(&self, queries: Vec<BatchQuery>, options: BatchOptions) -> BatchReport {
        let started_at = Utc::now();
        let concurrency = options
            .concurrency
            .unwrap_or(self.config().batch_concurrency)
            .max(1);
        info!(total = queries.len(), concurrency, "Processing batch of queries");

        let mut indexed: Vec<(usize, QueryResponse)> = stream::iter(queries.into_iter().enumerate())
            .map(|(index, item)| {
                let mut request = QueryRequest::new(item.query)
                    .executing(options.execute)
                    .reviewed(options.review);
                request.domain = options.domain.clone();
                request.save_results = options.save_results;
                let query_span = span!(Level::INFO, "process_query_in_batch", index, category = ?item.category);
                async move { (index, self.process(request).await) }.instrument(query_span)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<QueryResponse> = indexed.into_iter().map(|(_, r)| r).collect();

        let summary = BatchSummary::from_results(&results, started_at);
        info!(
            total = summary.total,
            successful_generation = summary.successful_generation,
            successful_execution = summary.successful_execution,
            failed = summary.failed,
            "Batch complete"
        );

        let summary_path = if self.should_save(options.save_results) {
            self.store().save_summary(&summary, started_at).await
        } else {
            None
        };

        BatchReport {
            results,
            summary,
            summary_path,
        }
    }
}
