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

//! Wraps generated code in a runnable script.
//!
//! Every script prints, in order: a `SQL Query:` header and the SQL, a blank
//! line, a `Result:` header and a preview of at most ten rows, one
//! `PD_JSON::<json|null>` line with the table in split orientation, and a
//! final `PD_JSON_END` line. The executor depends on this layout.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::config::RuntimeMode;
use crate::domains::Domain;
use crate::error::PipelineResult;

pub const JSON_MARKER: &str = "PD_JSON::";
pub const JSON_END_MARKER: &str = "PD_JSON_END";

#[derive(Debug, Clone, Serialize)]
pub struct AdaptedScript {
    pub text: String,
    pub path: PathBuf,
}

/// A Python string literal for `value`; JSON string syntax is valid Python.
fn py_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}

fn py_path(path: &Path) -> String {
    py_str(&path.to_string_lossy())
}

fn indent(code: &str, prefix: &str) -> String {
    code.lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_script(code: &str, domain: &Domain, mode: RuntimeMode) -> String {
    match mode {
        RuntimeMode::Pydough => render_pydough(code, domain),
        RuntimeMode::Mock => render_mock(code, domain),
    }
}

fn render_pydough(code: &str, domain: &Domain) -> String {
    let metadata = py_path(&domain.metadata_path);
    let database = py_path(&domain.database_path);
    let graph = py_str(&domain.name);
    let body = indent(code.trim(), "    ");

    format!(
        r#"
import pydough
from pydough import init_pydough_context

# Load metadata and connect to database
pydough.active_session.load_metadata_graph({metadata}, {graph})
pydough.active_session.connect_database("sqlite", database={database})

@init_pydough_context(pydough.active_session.metadata)
def func():
    # Generated PyDough code
{body}
    return result

result = func()
print("\nSQL Query:")
print(pydough.to_sql(result))
df = pydough.to_df(result)
print("\nResult:")
print(df.head(10))
try:
    payload = df.to_json(orient="split", default_handler=str)
except Exception:
    payload = "null"
print("{JSON_MARKER}" + payload)
print("{JSON_END_MARKER}")
"#
    )
}

fn render_mock(code: &str, domain: &Domain) -> String {
    let original = code
        .lines()
        .map(|line| format!("# {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    let sql = py_str(&format!(
        "SELECT name, email FROM {}_customers",
        domain.name.to_lowercase()
    ));

    format!(
        r#"
import json

# Mock execution: the PyDough runtime is not used.
# Original code:
{original}

columns = ["name", "email"]
rows = [
    ["John Doe", "john@example.com"],
    ["Jane Smith", "jane@example.com"],
    ["Bob Johnson", "bob@example.com"],
]

print("\nSQL Query:")
print({sql})
print("\nResult:")
print("    ".join(columns))
for row in rows[:10]:
    print("    ".join(str(v) for v in row))
payload = json.dumps({{"columns": columns, "index": list(range(len(rows))), "data": rows}})
print("{JSON_MARKER}" + payload)
print("{JSON_END_MARKER}")
"#
    )
}

/// Renders scripts and writes them under the results directory.
#[derive(Debug, Clone)]
pub struct CodeAdapter {
    output_dir: PathBuf,
    mode: RuntimeMode,
}

impl CodeAdapter {
    pub fn new(output_dir: impl Into<PathBuf>, mode: RuntimeMode) -> Self {
        Self {
            output_dir: output_dir.into(),
            mode,
        }
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    /// Writes `<output_dir>/<script_name>`, replacing any existing file.
    pub async fn adapt(
        &self,
        code: &str,
        domain: &Domain,
        script_name: &str,
    ) -> PipelineResult<AdaptedScript> {
        let text = render_script(code, domain, self.mode);
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(script_name);
        tokio::fs::write(&path, &text).await?;
        info!(domain = %domain.name, path = %path.display(), mode = ?self.mode, "Wrote adapted script");
        Ok(AdaptedScript { text, path })
    }
}
