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

//! Runs adapted scripts in a child interpreter with a hard timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

static SQL_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)SQL Query:\s*\n(.*?)(?:\n\nResult:|\z)").expect("valid SQL block regex")
});

static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^PD_JSON::(.*)\r?\n^PD_JSON_END\r?$").expect("valid marker regex")
});

/// How long readers may keep draining pipes once the child is reaped.
const READER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultData {
    pub table_json: Option<Value>,
}

/// Result of one script run.
///
/// Built only through [`ExecutionOutcome::succeeded`] and
/// [`ExecutionOutcome::failed`]: a success always carries output and a
/// failure always carries a non-empty error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    success: bool,
    #[serde(default)]
    output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partial_output: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partial_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
    #[serde(default)]
    result_data: ResultData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    return_code: Option<i32>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    timed_out: bool,
}

/// Failure details beyond the error message.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    pub partial_output: Option<String>,
    pub partial_error: Option<String>,
    pub return_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn succeeded(
        output: String,
        sql: Option<String>,
        table_json: Option<Value>,
        return_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        Self {
            success: true,
            output: Some(output),
            partial_output: None,
            error: None,
            partial_error: None,
            sql,
            result_data: ResultData { table_json },
            return_code,
            duration_ms: duration.as_millis() as u64,
            timed_out: false,
        }
    }

    pub fn failed(error: impl Into<String>, context: FailureContext, duration: Duration) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            "Execution failed".to_string()
        } else {
            error
        };
        Self {
            success: false,
            output: None,
            partial_output: context.partial_output.filter(|s| !s.is_empty()),
            error: Some(error),
            partial_error: context.partial_error.filter(|s| !s.is_empty()),
            sql: None,
            result_data: ResultData::default(),
            return_code: context.return_code,
            duration_ms: duration.as_millis() as u64,
            timed_out: context.timed_out,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn partial_output(&self) -> Option<&str> {
        self.partial_output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn partial_error(&self) -> Option<&str> {
        self.partial_error.as_deref()
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn result_data(&self) -> &ResultData {
        &self.result_data
    }

    pub fn table(&self) -> Option<SplitTable> {
        self.result_data
            .table_json
            .as_ref()
            .and_then(SplitTable::from_value)
    }

    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

/// A table serialised in pandas' split orientation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitTable {
    pub columns: Vec<Value>,
    #[serde(default)]
    pub index: Vec<Value>,
    pub data: Vec<Vec<Value>>,
}

impl SplitTable {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(display_cell).collect()
    }

    /// Rows as display strings.
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.data
            .iter()
            .map(|row| row.iter().map(display_cell).collect())
            .collect()
    }
}

fn display_cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parsed marker protocol: SQL text and the split-orientation table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolOutput {
    pub sql: Option<String>,
    pub table_json: Option<Value>,
    pub marker_found: bool,
}

/// Reads the marker protocol from captured stdout. When several marker
/// blocks are present the last one wins.
pub fn parse_protocol_output(stdout: &str) -> ProtocolOutput {
    let sql = extract_sql(stdout);

    let Some(captures) = JSON_BLOCK.captures_iter(stdout).last() else {
        return ProtocolOutput {
            sql,
            table_json: None,
            marker_found: false,
        };
    };

    let payload = captures[1].trim();
    let table_json = if payload == "null" || payload.is_empty() {
        None
    } else {
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Result marker payload is not valid JSON");
                None
            }
        }
    };

    ProtocolOutput {
        sql,
        table_json,
        marker_found: true,
    }
}

pub fn extract_sql(output: &str) -> Option<String> {
    SQL_BLOCK
        .captures(output)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn spawn_reader<R>(reader: Option<R>, buffer: SharedBuffer) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = reader?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    }))
}

fn drain(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Waits for the pipe readers until `deadline`, then aborts the stragglers.
/// A background grandchild can hold a pipe open after the child exits.
async fn join_readers(handles: Vec<JoinHandle<()>>, deadline: tokio::time::Instant) {
    for handle in handles {
        let abort = handle.abort_handle();
        if tokio::time::timeout_at(deadline, handle).await.is_err() {
            debug!("Output pipe still open at deadline; abandoning reader");
            abort.abort();
        }
    }
}

fn grace_deadline() -> tokio::time::Instant {
    tokio::time::Instant::now() + READER_GRACE
}

#[derive(Debug, Clone)]
pub struct SandboxedExecutor {
    interpreter: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl SandboxedExecutor {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `script_path`. Failures of any kind come back as a failed
    /// outcome; nothing is raised and nothing is retried.
    #[instrument(skip(self), fields(interpreter = %self.interpreter, timeout_secs = self.timeout.as_secs()))]
    pub async fn execute(&self, script_path: &Path) -> ExecutionOutcome {
        let started = Instant::now();
        info!(script = %script_path.display(), "Executing script");

        let mut command = Command::new(&self.interpreter);
        command
            .arg(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "Failed to start interpreter");
                return ExecutionOutcome::failed(
                    format!("Failed to start interpreter '{}': {e}", self.interpreter),
                    FailureContext::default(),
                    started.elapsed(),
                );
            }
        };

        let stdout_buf = SharedBuffer::default();
        let stderr_buf = SharedBuffer::default();
        let readers: Vec<JoinHandle<()>> = [
            spawn_reader(child.stdout.take(), stdout_buf.clone()),
            spawn_reader(child.stderr.take(), stderr_buf.clone()),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Script exceeded timeout; killing child");
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Kill signal failed; child may have exited");
                }
                let _ = child.wait().await;
                join_readers(readers, grace_deadline()).await;

                return ExecutionOutcome::failed(
                    format!(
                        "Execution timed out after {} seconds",
                        self.timeout.as_secs()
                    ),
                    FailureContext {
                        partial_output: Some(drain(&stdout_buf)),
                        partial_error: Some(drain(&stderr_buf)),
                        return_code: None,
                        timed_out: true,
                    },
                    started.elapsed(),
                );
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                join_readers(readers, grace_deadline()).await;
                return ExecutionOutcome::failed(
                    format!("Failed to wait for interpreter: {e}"),
                    FailureContext {
                        partial_output: Some(drain(&stdout_buf)),
                        partial_error: Some(drain(&stderr_buf)),
                        ..FailureContext::default()
                    },
                    started.elapsed(),
                );
            }
        };

        let remaining = self.timeout.saturating_sub(started.elapsed());
        join_readers(
            readers,
            tokio::time::Instant::now() + remaining.max(READER_GRACE),
        )
        .await;
        let stdout = drain(&stdout_buf);
        let stderr = drain(&stderr_buf);
        let elapsed = started.elapsed();

        if !status.success() {
            warn!(return_code = ?status.code(), "Script exited with failure");
            let error = if stderr.trim().is_empty() {
                format!("Script exited with {status}")
            } else {
                stderr
            };
            return ExecutionOutcome::failed(
                error,
                FailureContext {
                    partial_output: Some(stdout),
                    partial_error: None,
                    return_code: status.code(),
                    timed_out: false,
                },
                elapsed,
            );
        }

        let parsed = parse_protocol_output(&stdout);
        if !parsed.marker_found {
            debug!("No result marker block in script output");
        }
        info!(duration_ms = elapsed.as_millis() as u64, has_table = parsed.table_json.is_some(), "Script finished");

        ExecutionOutcome::succeeded(
            stdout,
            parsed.sql,
            parsed.table_json,
            status.code(),
            elapsed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_protocol_reads_sql_and_table() {
        let stdout = "\nSQL Query:\nSELECT name FROM nation\n\nResult:\n   name\n0  CHINA\nPD_JSON::{\"columns\":[\"name\"],\"index\":[0],\"data\":[[\"CHINA\"]]}\nPD_JSON_END\n";
        let parsed = parse_protocol_output(stdout);

        assert_eq!(parsed.sql.as_deref(), Some("SELECT name FROM nation"));
        assert!(parsed.marker_found);
        assert_eq!(
            parsed.table_json,
            Some(json!({"columns": ["name"], "index": [0], "data": [["CHINA"]]}))
        );
    }

    #[test]
    fn test_null_payload_means_no_table() {
        let parsed = parse_protocol_output("PD_JSON::null\nPD_JSON_END\n");
        assert!(parsed.marker_found);
        assert_eq!(parsed.table_json, None);
    }

    #[test]
    fn test_last_marker_block_wins() {
        let stdout = "PD_JSON::{\"a\":1}\nPD_JSON_END\nnoise\nPD_JSON::{\"a\":2}\r\nPD_JSON_END\n";
        assert_eq!(parse_protocol_output(stdout).table_json, Some(json!({"a": 2})));
    }

    #[test]
    fn test_marker_text_inside_user_output_is_ignored() {
        let stdout = "debug PD_JSON::oops\nmore noise\nPD_JSON::{\"columns\":[\"a\"],\"index\":[0],\"data\":[[1]]}\nPD_JSON_END\n";
        let parsed = parse_protocol_output(stdout);
        assert!(parsed.marker_found);
        assert_eq!(
            parsed.table_json,
            Some(json!({"columns": ["a"], "index": [0], "data": [[1]]}))
        );
    }

    #[test]
    fn test_marker_requires_end_line() {
        let parsed = parse_protocol_output("PD_JSON::{\"a\":1}\nPD_JSON_END trailing\n");
        assert!(!parsed.marker_found);
    }

    #[test]
    fn test_missing_marker() {
        let parsed = parse_protocol_output("hello\n");
        assert!(!parsed.marker_found);
        assert_eq!(parsed, ProtocolOutput::default());
    }

    #[test]
    fn test_sql_runs_to_end_without_result_header() {
        assert_eq!(
            extract_sql("SQL Query:\nSELECT 1\nFROM t").as_deref(),
            Some("SELECT 1\nFROM t")
        );
    }

    #[test]
    fn test_failed_outcome_always_has_error() {
        let outcome = ExecutionOutcome::failed("  ", FailureContext::default(), Duration::ZERO);
        assert!(!outcome.success());
        assert_eq!(outcome.error(), Some("Execution failed"));
        assert!(outcome.output().is_none());
    }

    #[test]
    fn test_split_table_rows() {
        let table = SplitTable::from_value(&json!({
            "columns": ["name", "balance"],
            "index": [0, 1],
            "data": [["a", 1.5], ["b", null]]
        }))
        .unwrap();
        assert_eq!(table.column_names(), vec!["name", "balance"]);
        assert_eq!(table.rows()[1], vec!["b".to_string(), String::new()]);
    }
}
