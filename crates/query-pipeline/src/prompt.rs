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

//! Prompt text for classification, generation and review.
//!
//! Everything here is pure string assembly; file access happens in the callers.

use std::path::Path;

use tracing::{debug, warn};

use crate::domains::{Domain, DomainRegistry};
use crate::types::ConversationTurn;

pub const USER_QUERY_ANCHOR: &str = "# User Query";

/// Condensed reference used when no cheatsheet file is available.
pub const DEFAULT_CHEATSHEET: &str = "\
## Collections and sub-collections
- Access a collection from the graph: `Graph.Collection`
- Navigate relationships with dot access: `nations.region.name`

## Core operations
- `CALCULATE(name=expr, ...)` selects or derives fields.
- `WHERE(condition)` filters; combine conditions with `&`, `|` and `~`.
- `ORDER_BY(field.ASC(), other.DESC())` sorts.
- `TOP_K(n, by=field.DESC())` keeps the first n records.
- `PARTITION(collection, name=\"grp\", by=(key))` groups records.

## Aggregations
- `COUNT(sub)`, `SUM(sub.field)`, `AVG(sub.field)`, `MIN(...)`, `MAX(...)`, `NDISTINCT(...)`
- `HAS(sub)` / `HASNOT(sub)` test whether related records exist.

## Rules
- The final expression must be bound to a variable named `result`.
- Do not import modules or call external functions.";

/// Builds the code-generation prompt.
///
/// History turns are spliced immediately before the user query section. When
/// the anchor is missing the history block is prepended instead.
pub fn build_prompt(
    query: &str,
    domain: &Domain,
    schema_doc: &str,
    cheatsheet: &str,
    history: &[ConversationTurn],
) -> String {
    let name = &domain.name;
    let hints = domain.collection_hints.as_deref().unwrap_or_default();

    let prompt = format!(
        r#"
# Task: Convert a natural language query into PyDough code for a {name} database

# Domain Information
Current Domain: {name}
{hints}

{USER_QUERY_ANCHOR}
{query}

# {name} Schema Information
{schema_doc}

# PyDough Cheatsheet
{cheatsheet}

# Example 1: List all records from a collection
```python
result = {name}.YourCollectionName.CALCULATE(
    # Select all fields using * or specify field names:
    # field_one, field_two
    *
)
```

# Example 2: Filter records from a collection by a condition
```python
result = {name}.YourCollectionName.WHERE(
    # Example condition: field_name == "some_value"
    your_field_name == "example_value"
).CALCULATE(
    specific_field_name_1,
    specific_field_name_2
)
```

# Your task:
Given the user query, schema information, and PyDough cheatsheet above, create PyDough code that correctly answers the query.
Respond with a JSON object with the fields "code" (the PyDough code, which must assign the final value to a variable named 'result') and "explanation" (one or two sentences).
"#
    );

    splice_history(prompt, history)
}

fn splice_history(prompt: String, history: &[ConversationTurn]) -> String {
    if history.is_empty() {
        return prompt;
    }

    let rendered = history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n");
    let block = format!("# Conversation History\n{rendered}\n\n");

    match prompt.find(USER_QUERY_ANCHOR) {
        Some(idx) => {
            let mut out = String::with_capacity(prompt.len() + block.len());
            out.push_str(&prompt[..idx]);
            out.push_str(&block);
            out.push_str(&prompt[idx..]);
            out
        }
        None => format!("{block}{prompt}"),
    }
}

/// Prompt asking the classifier to name the best matching domain.
pub fn build_classification_prompt(query: &str, registry: &DomainRegistry) -> String {
    let domain_list = registry
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let keywords = d.keywords.iter().take(5).cloned().collect::<Vec<_>>();
            format!("{}. {} - {}", i + 1, d.name, keywords.join(", "))
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"
Identify which database domain this query is asking about:
"{query}"

Available domains:
{domain_list}

Return the domain name that best matches the query.
"#
    )
}

pub fn build_review_prompt(code: &str) -> String {
    format!(
        r#"
Review and improve this PyDough code to ensure it is syntactically correct and follows best practices.
Fix any potential issues and return only the corrected code in the "reviewed_code" field.

```python
{code}
```

Ensure the code:
1. Uses proper PyDough syntax
2. Has correct property and collection references
3. Assigns the final result to a variable named 'result'
4. Has no syntax errors
"#
    )
}

/// Reads the cheatsheet, falling back to [`DEFAULT_CHEATSHEET`].
pub fn load_cheatsheet(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_CHEATSHEET.to_string();
    };
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => content,
        Ok(_) => {
            warn!(path = %path.display(), "Cheatsheet is empty; using built-in reference");
            DEFAULT_CHEATSHEET.to_string()
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cheatsheet unavailable; using built-in reference");
            DEFAULT_CHEATSHEET.to_string()
        }
    }
}
