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

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use query_pipeline::SandboxedExecutor;
use serde_json::json;
use tempfile::TempDir;

fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_successful_run_parses_markers() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(
        &dir,
        "ok.sh",
        "printf '\\nSQL Query:\\nSELECT name FROM nation\\n\\nResult:\\n  name\\n0 CHINA\\n'\n\
         printf 'PD_JSON::{\"columns\":[\"name\"],\"index\":[0],\"data\":[[\"CHINA\"]]}\\nPD_JSON_END\\n'\n",
    );

    let outcome = SandboxedExecutor::new("sh", Duration::from_secs(5))
        .execute(&path)
        .await;

    assert!(outcome.success(), "{:?}", outcome.error());
    assert_eq!(outcome.sql(), Some("SELECT name FROM nation"));
    assert_eq!(
        outcome.result_data().table_json,
        Some(json!({"columns": ["name"], "index": [0], "data": [["CHINA"]]}))
    );
    assert_eq!(outcome.table().unwrap().rows(), vec![vec!["CHINA".to_string()]]);
    assert_eq!(outcome.return_code(), Some(0));
    assert!(outcome.output().unwrap().contains("Result:"));
}

#[tokio::test]
async fn test_success_without_marker_has_no_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "plain.sh", "echo hello\n");

    let outcome = SandboxedExecutor::new("sh", Duration::from_secs(5))
        .execute(&path)
        .await;

    assert!(outcome.success());
    assert_eq!(outcome.output(), Some("hello\n"));
    assert!(outcome.result_data().table_json.is_none());
    assert!(outcome.sql().is_none());
}

#[tokio::test]
async fn test_non_zero_exit_reports_stderr_and_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(
        &dir,
        "fail.sh",
        "echo 'SQL Query:'\necho 'NameError: name x is not defined' >&2\nexit 3\n",
    );

    let outcome = SandboxedExecutor::new("sh", Duration::from_secs(5))
        .execute(&path)
        .await;

    assert!(!outcome.success());
    assert!(outcome.output().is_none());
    assert_eq!(outcome.error(), Some("NameError: name x is not defined\n"));
    assert_eq!(outcome.partial_output(), Some("SQL Query:\n"));
    assert_eq!(outcome.return_code(), Some(3));
    assert!(!outcome.timed_out());
}

#[tokio::test]
async fn test_silent_failure_gets_status_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "silent.sh", "exit 2\n");

    let outcome = SandboxedExecutor::new("sh", Duration::from_secs(5))
        .execute(&path)
        .await;

    assert!(!outcome.success());
    assert!(outcome.error().unwrap().starts_with("Script exited with"));
}

#[tokio::test]
async fn test_timeout_kills_child_and_keeps_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "slow.sh", "echo started\nexec sleep 30\n");

    let started = std::time::Instant::now();
    let outcome = SandboxedExecutor::new("sh", Duration::from_secs(1))
        .execute(&path)
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!outcome.success());
    assert!(outcome.timed_out());
    assert_eq!(outcome.error(), Some("Execution timed out after 1 seconds"));
    assert_eq!(outcome.partial_output(), Some("started\n"));
}

#[tokio::test]
async fn test_background_process_holding_pipes_does_not_outlive_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "detached.sh", "sleep 8 &\necho hi\nexit 0\n");

    let started = std::time::Instant::now();
    let outcome = SandboxedExecutor::new("sh", Duration::from_secs(1))
        .execute(&path)
        .await;

    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    assert!(outcome.success());
    assert_eq!(outcome.output(), Some("hi\n"));
}

#[tokio::test]
async fn test_missing_interpreter_is_a_failed_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "any.py", "print('hi')\n");

    let outcome = SandboxedExecutor::new("/nonexistent/interpreter", Duration::from_secs(5))
        .execute(&path)
        .await;

    assert!(!outcome.success());
    assert!(outcome
        .error()
        .unwrap()
        .starts_with("Failed to start interpreter '/nonexistent/interpreter'"));
}

#[tokio::test]
async fn test_missing_script_is_a_failed_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = SandboxedExecutor::new("sh", Duration::from_secs(5))
        .execute(&dir.path().join("absent.sh"))
        .await;

    assert!(!outcome.success());
    assert!(outcome.error().is_some());
}
