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

//! Extraction of `{code, explanation}` from model replies.
//!
//! Replies arrive in many shapes: clean JSON, JSON wrapped in prose, a
//! provider-parsed payload, a raw envelope, a mangled string with only a
//! recognisable `"code": "..."` pair, or a plain fenced block. Each shape has
//! a pure tier function; [`decode`] tries them in order and the first hit wins.

use llm_contracts::ProviderResponse;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeTier {
    StructuredText,
    EmbeddedObject,
    StructuredField,
    RawJson,
    RegexScrape,
    FencedBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub code: String,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedResponse {
    pub code: Option<String>,
    pub explanation: Option<String>,
    pub tier: Option<DecodeTier>,
}

type TierFn = fn(&ProviderResponse) -> Option<Extracted>;

const TIERS: &[(DecodeTier, TierFn)] = &[
    (DecodeTier::StructuredText, structured_text),
    (DecodeTier::EmbeddedObject, embedded_object),
    (DecodeTier::StructuredField, structured_field),
    (DecodeTier::RawJson, raw_json),
    (DecodeTier::RegexScrape, regex_scrape),
    (DecodeTier::FencedBlock, fenced_block),
];

static CODE_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""code"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid code field regex")
});

static EXPLANATION_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""explanation"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid explanation regex")
});

static FENCED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(?:python|py)?[ \t]*\r?\n?([\s\S]*?)```").expect("valid fence regex")
});

static RESULT_ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^result[ \t]*=(?:[^=]|$)").expect("valid result regex"));

static TOP_LEVEL_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)[ \t]*=(?:[^=]|$)").expect("valid assignment regex")
});

/// Runs the tier chain. A reply no tier understands yields `code: None`.
pub fn decode(response: &ProviderResponse) -> DecodedResponse {
    for (tier, extract) in TIERS {
        if let Some(extracted) = extract(response) {
            debug!(tier = ?tier, "Decoded model response");
            return DecodedResponse {
                code: Some(ensure_result_assignment(&extracted.code)),
                explanation: extracted.explanation,
                tier: Some(*tier),
            };
        }
    }
    debug!(
        content_len = response.content.len(),
        "No decoder tier could extract code"
    );
    DecodedResponse::default()
}

fn from_value(value: &Value) -> Option<Extracted> {
    let code = value.get("code")?.as_str()?.trim();
    if code.is_empty() {
        return None;
    }
    let explanation = value
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string);
    Some(Extracted {
        code: code.to_string(),
        explanation,
    })
}

fn from_json_text(text: &str) -> Option<Extracted> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .and_then(|v| from_value(&v))
}

pub fn structured_text(response: &ProviderResponse) -> Option<Extracted> {
    from_json_text(&response.content)
}

/// First JSON value starting at the first `{`; anything after it is ignored.
pub fn embedded_object(response: &ProviderResponse) -> Option<Extracted> {
    let start = response.content.find('{')?;
    let mut stream =
        serde_json::Deserializer::from_str(&response.content[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => from_value(&value),
        _ => None,
    }
}

pub fn structured_field(response: &ProviderResponse) -> Option<Extracted> {
    match response.structured.as_ref()? {
        Value::String(text) => from_json_text(text),
        value => from_value(value),
    }
}

/// The untouched envelope: either the answer object itself or a known
/// provider wrapper whose text part holds it.
pub fn raw_json(response: &ProviderResponse) -> Option<Extracted> {
    let raw = &response.raw_response;
    if let Some(found) = from_value(raw) {
        return Some(found);
    }
    if let Value::String(text) = raw {
        return from_json_text(text);
    }

    let candidates = [
        raw.pointer("/candidates/0/content/parts/0/text"),
        raw.pointer("/choices/0/message/content"),
        raw.pointer("/content/0/text"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(from_json_text)
}

pub fn regex_scrape(response: &ProviderResponse) -> Option<Extracted> {
    let haystack = scrape_source(response);
    let code = CODE_FIELD
        .captures(&haystack)
        .map(|c| unescape_json_fragment(&c[1]))?;
    if code.trim().is_empty() {
        return None;
    }
    let explanation = EXPLANATION_FIELD
        .captures(&haystack)
        .map(|c| unescape_json_fragment(&c[1]))
        .filter(|e| !e.trim().is_empty());
    Some(Extracted {
        code: code.trim().to_string(),
        explanation,
    })
}

pub fn fenced_block(response: &ProviderResponse) -> Option<Extracted> {
    let code = FENCED.captures(&response.content)?.get(1)?.as_str().trim();
    if code.is_empty() {
        return None;
    }
    Some(Extracted {
        code: code.to_string(),
        explanation: None,
    })
}

fn scrape_source(response: &ProviderResponse) -> String {
    if !response.content.trim().is_empty() {
        return response.content.clone();
    }
    match &response.raw_response {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn unescape_json_fragment(fragment: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{fragment}\"")).unwrap_or_else(|_| {
        fragment
            .replace("\\n", "\n")
            .replace("\\t", "\t")
            .replace("\\r", "\r")
            .replace("\\\"", "\"")
            .replace("\\/", "/")
            .replace("\\\\", "\\")
    })
}

/// Guarantees a top-level `result = ...` binding.
///
/// A trailing `return X` becomes `result = X`. Code with no top-level
/// assignment is one expression and is bound whole. Otherwise the last
/// top-level statement is bound: an assignment by appending
/// `result = <name>`, an expression by prefixing it.
pub fn ensure_result_assignment(code: &str) -> String {
    let code = code.trim();
    if code.is_empty() || RESULT_ASSIGNMENT.is_match(code) {
        return code.to_string();
    }

    let mut lines: Vec<String> = code.lines().map(str::to_string).collect();

    if let Some(last) = lines.iter().rposition(|l| !l.trim().is_empty()) {
        let trimmed = lines[last].trim_start();
        if let Some(rest) = trimmed.strip_prefix("return ") {
            lines[last] = format!("result = {}", rest.trim());
            return lines.join("\n");
        }
    }

    let top_level: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| is_top_level_statement(l))
        .map(|(i, _)| i)
        .collect();

    let has_assignment = top_level
        .iter()
        .any(|&i| TOP_LEVEL_ASSIGNMENT.is_match(&lines[i]));
    if !has_assignment {
        return format!("result = {code}");
    }

    let Some(&last_statement) = top_level.last() else {
        return format!("result = {code}");
    };
    if let Some(name) = TOP_LEVEL_ASSIGNMENT
        .captures(&lines[last_statement])
        .map(|c| c[1].to_string())
    {
        lines.push(format!("result = {name}"));
    } else {
        lines[last_statement] = format!("result = {}", lines[last_statement]);
    }
    lines.join("\n")
}

fn is_top_level_statement(line: &str) -> bool {
    match line.chars().next() {
        None => false,
        Some(c) if c.is_whitespace() => false,
        Some(c) => !matches!(c, ')' | ']' | '}' | '.' | '#' | ',' | '&' | '|'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(content: &str) -> ProviderResponse {
        ProviderResponse::from_text(content, "test-model")
    }

    #[test]
    fn test_clean_json_uses_first_tier() {
        let decoded = decode(&text(
            r#"{"code": "result = TPCH.nations.CALCULATE(name)", "explanation": "All nation names"}"#,
        ));
        assert_eq!(decoded.tier, Some(DecodeTier::StructuredText));
        assert_eq!(
            decoded.code.as_deref(),
            Some("result = TPCH.nations.CALCULATE(name)")
        );
        assert_eq!(decoded.explanation.as_deref(), Some("All nation names"));
    }

    #[test]
    fn test_json_wrapped_in_prose() {
        let decoded = decode(&text(
            "Sure! Here you go:\n{\"code\": \"result = Broker.Customers\"}\nLet me know if you need more.",
        ));
        assert_eq!(decoded.tier, Some(DecodeTier::EmbeddedObject));
        assert_eq!(decoded.code.as_deref(), Some("result = Broker.Customers"));
    }

    #[test]
    fn test_structured_field_object_and_string() {
        let mut response = text("not json at all");
        response.structured = Some(json!({"code": "result = Ewallet.Users"}));
        assert_eq!(decode(&response).tier, Some(DecodeTier::StructuredField));

        response.structured = Some(json!("{\"code\": \"result = Ewallet.Merchants\"}"));
        let decoded = decode(&response);
        assert_eq!(decoded.tier, Some(DecodeTier::StructuredField));
        assert_eq!(decoded.code.as_deref(), Some("result = Ewallet.Merchants"));
    }

    #[test]
    fn test_raw_envelope_text_part() {
        let mut response = text("");
        response.raw_response = json!({
            "candidates": [{"content": {"parts": [{"text": "{\"code\": \"result = TPCH.regions\"}"}]}}]
        });
        let decoded = decode(&response);
        assert_eq!(decoded.tier, Some(DecodeTier::RawJson));
        assert_eq!(decoded.code.as_deref(), Some("result = TPCH.regions"));
    }

    #[test]
    fn test_regex_scrape_recovers_truncated_json() {
        let decoded = decode(&text(
            r#"{"code": "result = TPCH.nations.WHERE(name == \"CHINA\")\n", "explanation": "Only Ch"#,
        ));
        assert_eq!(decoded.tier, Some(DecodeTier::RegexScrape));
        assert_eq!(
            decoded.code.as_deref(),
            Some(r#"result = TPCH.nations.WHERE(name == "CHINA")"#)
        );
    }

    #[test]
    fn test_fenced_block_fallback() {
        let decoded = decode(&text(
            "Here is the code:\n```python\nTPCH.suppliers.CALCULATE(name)\n```",
        ));
        assert_eq!(decoded.tier, Some(DecodeTier::FencedBlock));
        assert_eq!(
            decoded.code.as_deref(),
            Some("result = TPCH.suppliers.CALCULATE(name)")
        );
    }

    #[test]
    fn test_unusable_reply_yields_none() {
        let decoded = decode(&text("I cannot help with that."));
        assert_eq!(decoded, DecodedResponse::default());

        let decoded = decode(&text(r#"{"code": "   ", "explanation": "empty"}"#));
        assert!(decoded.code.is_none());
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let response = text("prefix {\"code\": \"TPCH.parts\"} suffix");
        assert_eq!(decode(&response), decode(&response));
    }

    #[test]
    fn test_single_expression_is_bound() {
        assert_eq!(
            ensure_result_assignment("TPCH.nations"),
            "result = TPCH.nations"
        );
    }

    #[test]
    fn test_trailing_return_is_rewritten() {
        assert_eq!(
            ensure_result_assignment("return TPCH.nations"),
            "result = TPCH.nations"
        );
        assert_eq!(
            ensure_result_assignment("asia = TPCH.regions.WHERE(name == 'ASIA')\nreturn asia"),
            "asia = TPCH.regions.WHERE(name == 'ASIA')\nresult = asia"
        );
    }

    #[test]
    fn test_multiline_expression_is_bound_whole() {
        let code = "TPCH.nations.WHERE(\n    region.name == 'ASIA'\n).CALCULATE(name)";
        assert_eq!(ensure_result_assignment(code), format!("result = {code}"));
    }

    #[test]
    fn test_last_statement_is_bound_after_assignments() {
        let code = "asia = TPCH.regions.WHERE(name == 'ASIA')\nasia.nations.CALCULATE(name)";
        assert_eq!(
            ensure_result_assignment(code),
            "asia = TPCH.regions.WHERE(name == 'ASIA')\nresult = asia.nations.CALCULATE(name)"
        );

        let code = "asia = TPCH.regions.WHERE(name == 'ASIA')\nnames = asia.nations.CALCULATE(name)";
        assert_eq!(
            ensure_result_assignment(code),
            format!("{code}\nresult = names")
        );
    }

    #[test]
    fn test_existing_binding_is_untouched_and_idempotent() {
        let code = "result = TPCH.nations";
        assert_eq!(ensure_result_assignment(code), code);

        let once = ensure_result_assignment("x = 1\nx + 1");
        assert_eq!(ensure_result_assignment(&once), once);
    }

    #[test]
    fn test_comparison_is_not_an_assignment() {
        assert_eq!(
            ensure_result_assignment("result == 3"),
            "result = result == 3"
        );
    }
}
