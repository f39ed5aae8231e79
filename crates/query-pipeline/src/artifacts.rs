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

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::ExecutionOutcome;
use crate::types::QueryResponse;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W").expect("valid regex"));

const PARTIAL_OUTPUT_HEADER: &str = "\n\n--- Partial Output Before Error ---\n";
const RECORD_PREFIX: &str = "query_result_";

/// Files written for one request. Unset entries were not written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<PathBuf>,
}

/// First 20 characters of the query with non-word characters replaced.
pub fn safe_query(query: &str) -> String {
    let head: String = query.chars().take(20).collect();
    let cleaned = NON_WORD.replace_all(&head, "_");
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "query".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// `<domain_lower>_<safe_query>_<ts>`, shared by every artifact of a request.
pub fn base_name(domain: &str, query: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        domain.to_lowercase(),
        safe_query(query),
        timestamp(at)
    )
}

pub fn script_file_name(domain: &str, query: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_query_{}_{}.py",
        domain.to_lowercase(),
        safe_query(query),
        timestamp(at)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub domain: Option<String>,
    #[serde(rename = "hasResults")]
    pub has_results: bool,
}

impl HistoryEntry {
    fn from_record(record: &QueryResponse) -> Self {
        let has_results = record
            .execution
            .as_ref()
            .map(|e| e.success())
            .unwrap_or(false);
        Self {
            id: record.id.clone(),
            query: record.query.clone(),
            timestamp: record.timestamp,
            domain: record.domain.clone(),
            has_results,
        }
    }
}

/// Writes request artifacts under one directory.
///
/// Write failures are logged and reported as a missing path; they never
/// fail the request that produced them.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write(&self, file_name: &str, contents: &[u8]) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(path = %self.dir.display(), error = %e, "Failed to create artifacts directory");
            return None;
        }
        let path = self.dir.join(file_name);
        match tokio::fs::write(&path, contents).await {
            Ok(()) => {
                debug!(path = %path.display(), bytes = contents.len(), "Persisted artifact");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to persist artifact");
                None
            }
        }
    }

    /// SQL and output files for a success, an error file for a failure.
    pub async fn save_execution(&self, base: &str, outcome: &ExecutionOutcome) -> ArtifactSet {
        let mut set = ArtifactSet::default();

        if outcome.success() {
            if let Some(sql) = outcome.sql() {
                set.sql_path = self.write(&format!("sql_{base}.sql"), sql.as_bytes()).await;
            }
            if let Some(output) = outcome.output() {
                set.output_path = self
                    .write(&format!("output_{base}.txt"), output.as_bytes())
                    .await;
            }
        } else {
            let mut text = outcome.error().unwrap_or_default().to_string();
            if let Some(partial) = outcome.partial_output() {
                text.push_str(PARTIAL_OUTPUT_HEADER);
                text.push_str(partial);
            }
            set.error_path = self
                .write(&format!("error_{base}.txt"), text.as_bytes())
                .await;
        }

        info!(
            base = %base,
            success = outcome.success(),
            sql = set.sql_path.is_some(),
            output = set.output_path.is_some(),
            error = set.error_path.is_some(),
            "Saved execution artifacts"
        );
        set
    }

    pub fn record_path(&self, base: &str) -> PathBuf {
        self.dir.join(format!("{RECORD_PREFIX}{base}.json"))
    }

    pub async fn save_record(&self, base: &str, record: &QueryResponse) -> Option<PathBuf> {
        let bytes = match serde_json::to_vec_pretty(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialise query record");
                return None;
            }
        };
        let path = self
            .write(&format!("{RECORD_PREFIX}{base}.json"), &bytes)
            .await?;
        info!(path = %path.display(), id = %record.id, "Saved query record");
        Some(path)
    }

    pub async fn save_summary<T: Serialize>(&self, summary: &T, at: DateTime<Utc>) -> Option<PathBuf> {
        let bytes = match serde_json::to_vec_pretty(summary) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialise processing summary");
                return None;
            }
        };
        let path = self
            .write(&format!("processing_summary_{}.json", timestamp(at)), &bytes)
            .await?;
        info!(path = %path.display(), "Saved processing summary");
        Some(path)
    }

    async fn read_records(&self) -> Vec<(PathBuf, QueryResponse)> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %self.dir.display(), error = %e, "No artifacts directory to read");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(RECORD_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_record {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<QueryResponse>(&bytes).ok());
            match parsed {
                Some(record) => records.push((path, record)),
                None => warn!(path = %path.display(), "Skipping unreadable query record"),
            }
        }
        records
    }

    /// Saved records, newest first.
    pub async fn list_history(&self) -> Vec<HistoryEntry> {
        let mut history: Vec<HistoryEntry> = self
            .read_records()
            .await
            .iter()
            .map(|(_, record)| HistoryEntry::from_record(record))
            .collect();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history
    }

    /// Finds a record by response id or by file name without the prefix.
    pub async fn load_record(&self, id: &str) -> Option<QueryResponse> {
        self.read_records()
            .await
            .into_iter()
            .find(|(path, record)| {
                record.id == id
                    || path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.strip_prefix(RECORD_PREFIX))
                        == Some(id)
            })
            .map(|(_, record)| record)
    }
}
