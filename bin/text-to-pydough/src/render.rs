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

//! Terminal output for the CLI commands.

use query_pipeline::{
    BatchReport, DomainRegistry, ExecutionOutcome, HistoryEntry, QueryResponse, SplitTable,
};

const RULE_WIDTH: usize = 80;
const MAX_CELL: usize = 40;

fn rule() -> String {
    "─".repeat(RULE_WIDTH)
}

fn clip(cell: &str) -> String {
    if cell.chars().count() > MAX_CELL {
        let head: String = cell.chars().take(MAX_CELL - 1).collect();
        format!("{head}…")
    } else {
        cell.to_string()
    }
}

pub fn print_table(table: &SplitTable) {
    let headers: Vec<String> = table.column_names().iter().map(|c| clip(c)).collect();
    let rows: Vec<Vec<String>> = table
        .rows()
        .iter()
        .map(|row| row.iter().map(|c| clip(c)).collect())
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let line = |cells: &[String]| {
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c:<width$}", width = widths.get(i).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(" │ ")
    };

    println!("{}", line(&headers));
    println!(
        "{}",
        widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("─┼─")
    );
    for row in &rows {
        println!("{}", line(row));
    }
    println!("({} rows)", rows.len());
}

pub fn print_outcome(outcome: &ExecutionOutcome) {
    if outcome.success() {
        println!("Execution succeeded in {} ms", outcome.duration_ms());
        if let Some(sql) = outcome.sql() {
            println!("\nSQL:\n{sql}");
        }
        match outcome.table() {
            Some(table) => {
                println!();
                print_table(&table);
            }
            None => {
                if let Some(output) = outcome.output() {
                    println!("\nOutput:\n{output}");
                }
            }
        }
    } else {
        println!("Execution failed: {}", outcome.error().unwrap_or("unknown error"));
        if let Some(partial) = outcome.partial_output() {
            println!("\nPartial output:\n{partial}");
        }
    }
}

pub fn print_response(response: &QueryResponse) {
    println!("{}", rule());
    println!("Query:  {}", response.query);
    println!(
        "Domain: {}",
        response.domain.as_deref().unwrap_or("(undetermined)")
    );
    println!("{}", rule());

    if let Some(code) = response.reviewed_code.as_ref().or(response.pydough_code.as_ref()) {
        println!("PyDough code:\n{code}");
    }
    if let Some(explanation) = &response.explanation {
        println!("\nExplanation:\n{explanation}");
    }
    if let Some(execution) = &response.execution {
        println!();
        print_outcome(execution);
    }
    if let Some(error) = &response.error {
        println!("\nError: {error}");
    }
    if let Some(path) = response.artifacts.as_ref().and_then(|a| a.summary_path.as_ref()) {
        println!("\nSaved: {}", path.display());
    }
}

pub fn print_batch(report: &BatchReport) {
    for (i, result) in report.results.iter().enumerate() {
        let status = if result.success { "ok" } else { "FAILED" };
        println!(
            "[{:>3}] {:<6} {:<15} {}",
            i + 1,
            status,
            result.domain.as_deref().unwrap_or("-"),
            result.query
        );
        if let Some(error) = &result.error {
            println!("       {}", error.lines().next().unwrap_or_default());
        }
    }
    let summary = &report.summary;
    println!("{}", rule());
    println!(
        "Total: {}  Generated: {}  Executed: {}  Failed: {}",
        summary.total, summary.successful_generation, summary.successful_execution, summary.failed
    );
    if let Some(path) = &report.summary_path {
        println!("Summary saved to {}", path.display());
    }
}

pub fn print_domains(registry: &DomainRegistry) {
    let default = registry.default_domain().name.clone();
    for domain in registry.iter() {
        let marker = if domain.name == default { " (default)" } else { "" };
        println!("{}{marker}", domain.name);
        println!("    keywords: {}", domain.keywords.join(", "));
        println!("    database: {}", domain.database_path.display());
    }
}

pub fn print_history(entries: &[HistoryEntry], limit: usize) {
    if entries.is_empty() {
        println!("No saved queries.");
        return;
    }
    for entry in entries.iter().take(limit) {
        println!(
            "{}  {:<15} {}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.domain.as_deref().unwrap_or("-"),
            if entry.has_results { "✓" } else { " " },
            entry.query
        );
        println!("    id: {}", entry.id);
    }
}
