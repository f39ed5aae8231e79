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

use std::io::Write;

use anyhow::Result;
use query_pipeline::{QueryGraph, QueryState};
use tokio::io::{AsyncBufReadExt, BufReader};

fn print_help() {
    println!("Ask a question about one of the databases. Follow-up questions keep context.");
    println!("Commands:");
    println!("   help   show this message");
    println!("   clear  start a new conversation");
    println!("   exit   quit (also 'quit')");
}

/// Reads questions from stdin until EOF or `exit`.
pub async fn run(graph: QueryGraph, domain: Option<String>, execute: bool) -> Result<()> {
    println!("PyDough chat. Type 'help' for commands.");
    if execute && !graph.execution_enabled() {
        println!("Execution is disabled in the configuration; code will not be run.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state: Option<QueryState> = None;

    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input.to_lowercase().as_str() {
            "exit" | "quit" => {
                println!("Goodbye!");
                break;
            }
            "help" => {
                print_help();
                continue;
            }
            "clear" => {
                state = None;
                println!("Conversation cleared.");
                continue;
            }
            _ => {}
        }

        let next = match state.take() {
            Some(previous) => previous.continue_with(input),
            None => {
                let fresh = QueryState::new(input).executing(execute);
                match &domain {
                    Some(name) => fresh.with_forced_domain(name.clone()),
                    None => fresh,
                }
            }
        };
        let seen = next.messages.len();

        let run = graph.invoke(next).await;
        for message in run.state.messages.iter().skip(seen) {
            println!("\n{}", message.content);
        }
        state = Some(run.state);
    }
    Ok(())
}
