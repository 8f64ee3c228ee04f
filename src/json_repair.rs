//! Recovery of JSON payloads from free-form model output.
//!
//! Models wrap JSON in Markdown fences, prefix it with prose, leave trailing commas, or get
//! cut off mid-structure. `parse_model_json` undoes all of that before deserializing.

use crate::types::{Result, StudyError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("Invalid fence regex");
    static ref TRAILING_COMMA: Regex =
        Regex::new(r",(\s*[}\]])").expect("Invalid trailing comma regex");
}

/// Closers still owed at the end of `json_str`, innermost last, and whether a string is open.
fn scan_open_structures(json_str: &str) -> Option<(Vec<char>, bool)> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in json_str.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                if stack.pop() != Some(ch) {
                    return None;
                }
            }
            _ => {}
        }
    }

    Some((stack, in_string))
}

/// Detects if a JSON string is complete (balanced braces, brackets and quotes).
pub fn is_json_complete(json_str: &str) -> bool {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return false;
    }
    matches!(scan_open_structures(trimmed), Some((stack, false)) if stack.is_empty())
}

/// Closes unclosed strings and structures in nesting order.
pub fn repair_json(json_str: &str) -> String {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }

    let mut result = TRAILING_COMMA.replace_all(trimmed, "$1").into_owned();
    let (stack, in_string) = match scan_open_structures(&result) {
        Some(state) => state,
        None => return result,
    };

    if in_string {
        result.push('"');
    }
    let tail = result.trim_end();
    if tail.ends_with(',') || tail.ends_with(':') {
        let cut = tail.len() - 1;
        result.truncate(cut);
    }
    for closer in stack.into_iter().rev() {
        result.push(closer);
    }

    result
}

/// Finds the JSON part of a model reply: a fenced block if present, else the span from the
/// first `{` or `[` onwards.
pub fn extract_json_payload(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_BLOCK.captures(text) {
        if let Some(body) = caps.get(1) {
            let body = body.as_str().trim();
            if !body.is_empty() {
                return Some(body);
            }
        }
    }

    let start = text.find(['{', '['])?;
    let candidate = &text[start..];
    let end = candidate.rfind(['}', ']']).map(|i| i + 1).unwrap_or(candidate.len());
    // A truncated reply has no closer after the last opener; keep the whole tail for repair.
    if is_json_complete(&candidate[..end]) {
        Some(&candidate[..end])
    } else {
        Some(candidate.trim())
    }
}

/// Attempts to parse JSON, with fallback to repair and retry.
pub fn parse_json_with_repair(json_str: &str) -> std::result::Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return Ok(value);
    }

    let repaired = repair_json(json_str);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            tracing::debug!(
                "[JSON-REPAIR] Successfully repaired JSON: {} -> {} chars",
                json_str.len(),
                repaired.len()
            );
            Ok(value)
        }
        Err(e) => Err(format!(
            "Failed to parse JSON even after repair: {} (original: {} chars, repaired: {} chars)",
            e,
            json_str.len(),
            repaired.len()
        )),
    }
}

/// Extracts, repairs and deserializes the JSON a model was asked to produce.
pub fn parse_model_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let payload = match extract_json_payload(text) {
        Some(p) => p,
        None => {
            return Err(StudyError::Parse(format!(
                "No JSON found in model reply: {}",
                crate::str_utils::prefix_chars(text, 120)
            ))
            .into())
        }
    };
    let value = parse_json_with_repair(payload).map_err(StudyError::Parse)?;
    serde_json::from_value(value)
        .map_err(|e| StudyError::Parse(format!("Unexpected JSON shape: {}", e)).into())
}
