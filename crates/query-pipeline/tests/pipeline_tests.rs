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

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llm_contracts::LLMError;
use llm_providers::{ApiClient, ScriptedClient};
use query_pipeline::{
    BatchOptions, BatchQuery, DomainRegistry, PipelineConfig, QueryPipeline, QueryRequest,
    RuntimeMode,
};

const TPCH_REPLY: &str =
    r#"{"code": "result = TPCH.nations.CALCULATE(name)", "explanation": "Nation names"}"#;

const PROTOCOL_OUTPUT: &str = r#"#!/bin/sh
printf '\nSQL Query:\nSELECT n_name FROM nation\n\nResult:\n  name\n0 CHINA\n'
printf 'PD_JSON::{"columns":["name"],"index":[0],"data":[["CHINA"]]}\nPD_JSON_END\n'
"#;

const FAILING_RUNTIME: &str = "#!/bin/sh\necho 'partial row'\necho 'KeyError: nations' >&2\nexit 1\n";

/// An executable standing in for the interpreter; it ignores the script.
fn fake_interpreter(dir: &Path, body: &str) -> String {
    let path = dir.join("fake-python");
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.display().to_string()
}

fn config(dir: &Path, python: &str) -> PipelineConfig {
    PipelineConfig {
        data_dir: dir.join("data"),
        results_dir: dir.join("results"),
        cheatsheet_path: None,
        python: python.to_string(),
        execution_timeout_secs: 5,
        classifier_timeout_secs: 2,
        generation_timeout_secs: 2,
        runtime_mode: RuntimeMode::Pydough,
        ..PipelineConfig::default()
    }
}

fn pipeline(dir: &Path, python: &str, client: Option<Arc<ScriptedClient>>) -> QueryPipeline {
    let registry = Arc::new(DomainRegistry::builtin(dir.join("data")));
    QueryPipeline::new(
        config(dir, python),
        registry,
        client.map(|c| c as Arc<dyn ApiClient>),
    )
}

fn results_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.join("results"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn test_generation_only_writes_script_and_record() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::from_texts([TPCH_REPLY]));
    let pipeline = pipeline(dir.path(), "sh", Some(client.clone()));

    let response = pipeline
        .process(QueryRequest::new("List all nation names").with_domain("TPCH"))
        .await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.domain.as_deref(), Some("TPCH"));
    assert_eq!(
        response.pydough_code.as_deref(),
        Some("result = TPCH.nations.CALCULATE(name)")
    );
    assert_eq!(response.explanation.as_deref(), Some("Nation names"));
    assert!(response.execution.is_none());
    assert!(response
        .adapted_code
        .as_deref()
        .unwrap()
        .contains("    result = TPCH.nations.CALCULATE(name)"));

    // Forced domains never consult the classifier.
    assert_eq!(client.requests().len(), 1);
    assert!(client.requests()[0].prompt_text().contains("List all nation names"));

    let files = results_files(dir.path());
    assert!(files.iter().any(|f| f.starts_with("tpch_query_List_all_nation_name_")));
    assert!(files.iter().any(|f| f.starts_with("query_result_tpch_List_all_nation_name_")));
    assert!(!files.iter().any(|f| f.starts_with("sql_")));

    let artifacts = response.artifacts.unwrap();
    assert!(artifacts.script_path.unwrap().exists());
    assert!(artifacts.summary_path.unwrap().exists());
}

#[tokio::test]
async fn test_execution_success_persists_sql_and_output() {
    let dir = tempfile::tempdir().unwrap();
    let python = fake_interpreter(dir.path(), PROTOCOL_OUTPUT);
    let client = Arc::new(ScriptedClient::from_texts([TPCH_REPLY]));
    let pipeline = pipeline(dir.path(), &python, Some(client));

    let response = pipeline
        .process(
            QueryRequest::new("List all nation names")
                .with_domain("TPCH")
                .executing(true),
        )
        .await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.sql.as_deref(), Some("SELECT n_name FROM nation"));
    let execution = response.execution.as_ref().unwrap();
    assert!(execution.success());
    assert_eq!(execution.table().unwrap().column_names(), vec!["name"]);

    let artifacts = response.artifacts.as_ref().unwrap();
    let sql = std::fs::read_to_string(artifacts.sql_path.as_ref().unwrap()).unwrap();
    assert_eq!(sql, "SELECT n_name FROM nation");
    assert!(artifacts.output_path.is_some());
    assert!(artifacts.error_path.is_none());
}

#[tokio::test]
async fn test_execution_failure_marks_response_failed() {
    let dir = tempfile::tempdir().unwrap();
    let python = fake_interpreter(dir.path(), FAILING_RUNTIME);
    let client = Arc::new(ScriptedClient::from_texts([TPCH_REPLY]));
    let pipeline = pipeline(dir.path(), &python, Some(client));

    let response = pipeline
        .process(
            QueryRequest::new("List all nation names")
                .with_domain("TPCH")
                .executing(true),
        )
        .await;

    assert!(!response.success);
    assert!(response.pydough_code.is_some());
    assert_eq!(response.error.as_deref(), Some("KeyError: nations\n"));

    let error_path = response.artifacts.unwrap().error_path.unwrap();
    let text = std::fs::read_to_string(error_path).unwrap();
    assert!(text.starts_with("KeyError: nations"));
    assert!(text.ends_with("--- Partial Output Before Error ---\npartial row\n"));
}

#[tokio::test]
async fn test_unknown_forced_domain_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::from_texts([TPCH_REPLY]));
    let pipeline = pipeline(dir.path(), "sh", Some(client.clone()));

    let response = pipeline
        .process(QueryRequest::new("anything").with_domain("Nope"))
        .await;

    assert!(!response.success);
    assert!(response
        .error
        .unwrap()
        .starts_with("Unknown domain 'Nope'. Known domains: Broker, Dealership"));
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn test_classifier_answer_is_resolved_case_insensitively() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::from_texts([
        r#"{"domain": "tpch", "confidence": 0.9}"#,
        TPCH_REPLY,
    ]));
    let pipeline = pipeline(dir.path(), "sh", Some(client.clone()));

    let response = pipeline
        .process(QueryRequest::new("What are the nations?").saving(false))
        .await;

    assert!(response.success);
    assert_eq!(response.domain.as_deref(), Some("TPCH"));
    assert_eq!(client.requests().len(), 2);
    assert!(results_files(dir.path())
        .iter()
        .all(|f| !f.starts_with("query_result_")));
}

#[tokio::test]
async fn test_classifier_failure_falls_back_to_keywords() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(vec![
        Err(LLMError::Network("connection reset".into())),
        Ok(llm_contracts::ProviderResponse::from_text(TPCH_REPLY, "scripted")),
    ]));
    let pipeline = pipeline(dir.path(), "sh", Some(client));

    let response = pipeline
        .process(QueryRequest::new("List every nation and its region").saving(false))
        .await;

    assert!(response.success);
    assert_eq!(response.domain.as_deref(), Some("TPCH"));
}

#[tokio::test]
async fn test_without_model_generation_fails_but_domain_is_chosen() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path(), "sh", None);

    let response = pipeline
        .process(QueryRequest::new("weather tomorrow").saving(false))
        .await;

    assert!(!response.success);
    assert_eq!(response.domain.as_deref(), Some("Broker"));
    assert!(response.pydough_code.is_none());
    assert!(response.error.unwrap().contains("No generative model is configured"));
}

#[tokio::test]
async fn test_undecodable_reply_is_a_decode_failure() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::from_texts(["I cannot help with that."]));
    let pipeline = pipeline(dir.path(), "sh", Some(client));

    let response = pipeline
        .process(QueryRequest::new("nations").with_domain("TPCH"))
        .await;

    assert!(!response.success);
    assert_eq!(
        response.error.as_deref(),
        Some("No code could be decoded from the model response")
    );
    assert_eq!(response.llm_response.as_deref(), Some("I cannot help with that."));
    assert!(response.artifacts.unwrap().script_path.is_none());
}

#[tokio::test]
async fn test_batch_reports_summary_in_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let python = fake_interpreter(dir.path(), PROTOCOL_OUTPUT);
    let client = Arc::new(ScriptedClient::repeating(
        llm_contracts::ProviderResponse::from_text(TPCH_REPLY, "scripted"),
    ));
    let pipeline = pipeline(dir.path(), &python, Some(client));

    let queries: Vec<BatchQuery> = ["first query", "second query", "third query"]
        .iter()
        .map(|q| BatchQuery {
            category: Some("tpch".into()),
            query: q.to_string(),
        })
        .collect();

    let report = pipeline
        .process_batch(
            queries,
            BatchOptions {
                domain: Some("TPCH".into()),
                execute: true,
                concurrency: Some(2),
                ..BatchOptions::default()
            },
        )
        .await;

    assert_eq!(
        report.results.iter().map(|r| r.query.as_str()).collect::<Vec<_>>(),
        vec!["first query", "second query", "third query"]
    );
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.successful_generation, 3);
    assert_eq!(report.summary.successful_execution, 3);
    assert_eq!(report.summary.failed, 0);
    assert!(report.summary_path.unwrap().exists());
}

#[tokio::test]
async fn test_run_script_uses_runfile_names() {
    let dir = tempfile::tempdir().unwrap();
    let python = fake_interpreter(dir.path(), PROTOCOL_OUTPUT);
    let pipeline = pipeline(dir.path(), &python, None);
    let script: PathBuf = dir.path().join("adhoc.py");
    std::fs::write(&script, "print('ignored')\n").unwrap();

    let run = pipeline.run_script(&script).await;

    assert!(run.outcome.success());
    assert!(run
        .artifacts
        .sql_path
        .unwrap()
        .ends_with("sql_runfile_adhoc.sql"));
}

#[tokio::test]
async fn test_history_lists_saved_records() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::from_texts([TPCH_REPLY]));
    let pipeline = pipeline(dir.path(), "sh", Some(client));

    let response = pipeline
        .process(QueryRequest::new("List all nation names").with_domain("TPCH"))
        .await;

    let history = pipeline.store().list_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, response.id);
    assert_eq!(history[0].domain.as_deref(), Some("TPCH"));

    let loaded = pipeline.store().load_record(&response.id).await.unwrap();
    assert_eq!(loaded.pydough_code, response.pydough_code);
}
