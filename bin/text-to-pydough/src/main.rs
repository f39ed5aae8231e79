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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use llm_contracts::ProviderResponse;
use llm_providers::{build_client, ApiClient, ScriptedClient};
use query_pipeline::{
    load_queries, BatchOptions, DomainRegistry, PipelineConfig, QueryGraph, QueryPipeline,
    QueryRequest, RuntimeMode,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod chat;
mod render;

/// Reply used when mock mode runs without a provider.
const MOCK_REPLY: &str = r#"{"code": "result = customers.CALCULATE(name, email)", "explanation": "Mock response: lists customer names and emails."}"#;

#[derive(Parser, Debug)]
#[command(
    name = "text-to-pydough",
    about = "Translate natural-language questions into PyDough queries"
)]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    results_dir: Option<PathBuf>,

    /// `pydough` or `mock`.
    #[arg(long, global = true)]
    mode: Option<String>,

    #[arg(long, global = true)]
    no_save: bool,

    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate (and optionally run) code for one question.
    Query {
        query: String,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        review: bool,
        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Process a CSV file with `Category` and `Query` columns.
    Batch {
        file: PathBuf,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        review: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Write the batch report here as JSON.
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Interactive conversation; follow-up questions keep context.
    Chat {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        execute: bool,
    },
    /// Execute an existing script and save its artifacts.
    RunFile {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List registered domains.
    Domains,
    /// Show which domain a question maps to.
    Detect { query: String },
    /// List saved query records, or show one.
    History {
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.results_dir {
        config.results_dir = dir.clone();
    }
    if let Some(mode) = &cli.mode {
        config.runtime_mode = mode.parse()?;
    }
    if cli.no_save {
        config.save_results = false;
    }
    Ok(config)
}

fn build_pipeline(config: PipelineConfig) -> Result<QueryPipeline> {
    let registry = match &config.domains_file {
        Some(path) => DomainRegistry::from_yaml_file(path)
            .with_context(|| format!("loading domains from {}", path.display()))?,
        None => DomainRegistry::builtin(&config.data_dir),
    };

    let client = build_client(&config.provider)?;
    let mock = config.runtime_mode == RuntimeMode::Mock;
    let pipeline = match client {
        Some(client) => {
            info!(provider = client.provider_name(), "Using generative model provider");
            QueryPipeline::new(config, Arc::new(registry), Some(client))
        }
        None if mock => {
            warn!("No model provider configured; mock mode answers with a canned reply");
            let scripted: Arc<dyn ApiClient> = Arc::new(ScriptedClient::repeating(
                ProviderResponse::from_text(MOCK_REPLY, "mock"),
            ));
            QueryPipeline::new(config, Arc::new(registry), Some(scripted)).with_classifier(None)
        }
        None => {
            warn!("No model provider configured; set LLM_PROVIDER and an API key to generate code");
            QueryPipeline::new(config, Arc::new(registry), None)
        }
    };
    Ok(pipeline)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = load_config(&cli)?;
    let pipeline = build_pipeline(config)?;

    match cli.cmd {
        Command::Query {
            query,
            domain,
            execute,
            review,
            json,
        } => {
            let mut request = QueryRequest::new(query).executing(execute).reviewed(review);
            request.domain = domain;
            let response = pipeline.process(request).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                render::print_response(&response);
            }
            if !response.success {
                std::process::exit(1);
            }
        }
        Command::Batch {
            file,
            category,
            domain,
            execute,
            review,
            concurrency,
            output,
        } => {
            let queries = load_queries(&file, category.as_deref())?;
            if queries.is_empty() {
                warn!(path = %file.display(), "No queries to process");
                return Ok(());
            }
            let report = pipeline
                .process_batch(
                    queries,
                    BatchOptions {
                        domain,
                        execute,
                        review,
                        save_results: None,
                        concurrency,
                    },
                )
                .await;
            render::print_batch(&report);
            if let Some(path) = output {
                std::fs::write(&path, serde_json::to_vec_pretty(&report)?)
                    .with_context(|| format!("writing batch report to {}", path.display()))?;
                println!("Report written to {}", path.display());
            }
        }
        Command::Chat { domain, execute } => {
            let graph = QueryGraph::new(Arc::new(pipeline));
            chat::run(graph, domain, execute).await?;
        }
        Command::RunFile { path, json } => {
            if !path.exists() {
                anyhow::bail!("script not found: {}", path.display());
            }
            let run = pipeline.run_script(&path).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                render::print_outcome(&run.outcome);
            }
            if !run.outcome.success() {
                std::process::exit(1);
            }
        }
        Command::Domains => render::print_domains(pipeline.registry()),
        Command::Detect { query } => {
            let selection = pipeline.select_domain(&query, None).await?;
            println!("{} ({:?})", selection.domain.name, selection.method);
        }
        Command::History { id, limit } => match id {
            Some(id) => {
                let record = pipeline
                    .store()
                    .load_record(&id)
                    .await
                    .with_context(|| format!("no saved record with id {id}"))?;
                render::print_response(&record);
            }
            None => render::print_history(&pipeline.store().list_history().await, limit),
        },
    }
    Ok(())
}
