//! Lenient JSON extraction from generative-analysis responses.
//!
//! The analysis collaborator is instructed to emit a single JSON object but
//! routinely wraps it in markdown fences, breaks string literals across
//! lines, or leaves stray commas. This module recovers the object through
//! an ordered sequence of pure repair passes, each independently testable:
//!
//! 1. strip code fences and a leading language tag
//! 2. direct parse
//! 3. extract the substring between the first `{` and the last `}`
//! 4. collapse newlines/tabs inside quoted string values
//! 5. remove trailing commas before `}`/`]` and stray leading commas
//! 6. final parse attempt
//!
//! [`parse_json_lenient`] never panics and logs which repair level
//! succeeded.

use tracing::{debug, warn};

/// Parse free-form generated text into a JSON value, or `None` when every
/// repair pass is exhausted.
pub fn parse_json_lenient(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let unfenced = strip_code_fences(trimmed);
    if let Ok(value) = serde_json::from_str(unfenced) {
        debug!(repair = "none", "response parsed directly");
        return Some(value);
    }

    let Some(braced) = extract_braced(unfenced) else {
        warn!(
            response_len = text.len(),
            "no JSON object found in response"
        );
        return None;
    };
    if let Ok(value) = serde_json::from_str(braced) {
        debug!(repair = "brace-extraction", "response parsed after extraction");
        return Some(value);
    }

    let collapsed = collapse_newlines_in_strings(braced);
    if let Ok(value) = serde_json::from_str(&collapsed) {
        debug!(
            repair = "newline-collapse",
            "response parsed after collapsing string newlines"
        );
        return Some(value);
    }

    let repaired = strip_stray_commas(&collapsed);
    match serde_json::from_str(&repaired) {
        Ok(value) => {
            debug!(
                repair = "comma-repair",
                "response parsed after comma repair"
            );
            Some(value)
        }
        Err(e) => {
            warn!(
                error = %e,
                response_len = text.len(),
                "all JSON repair passes failed"
            );
            None
        }
    }
}

/// Remove surrounding markdown code fences and a leading language tag.
///
/// Returns the input unchanged (trimmed) when it is not fenced.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line ("json", "JSON", ...) if present.
    let body = match rest.find('\n') {
        Some(nl) => rest.get(nl.saturating_add(1)..).unwrap_or(rest),
        None => rest,
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim()
}

/// Extract the substring between the first `{` and the last `}`, inclusive.
fn extract_braced(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    text.get(start..=end)
}

/// Collapse newlines, carriage returns, and tabs inside quoted string
/// values to single spaces.
///
/// Generative text often wraps long string literals across lines, which is
/// invalid JSON. Text outside string literals is left untouched.
fn collapse_newlines_in_strings(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut pending_space = false;

    for c in text.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
            continue;
        }
        if escaped {
            result.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\n' | '\r' | '\t' => pending_space = true,
            '"' => {
                in_string = false;
                pending_space = false;
                result.push(c);
            }
            '\\' => {
                if pending_space {
                    result.push(' ');
                    pending_space = false;
                }
                result.push(c);
                escaped = true;
            }
            _ => {
                if pending_space {
                    result.push(' ');
                    pending_space = false;
                }
                result.push(c);
            }
        }
    }

    result
}

/// Remove trailing commas before `}`/`]`, stray commas directly after
/// `{`/`[`, and runs of consecutive commas. String literals are respected.
fn strip_stray_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut last_significant: Option<char> = None;
    let mut in_string = false;
    let mut escaped = false;

    let mut i = 0usize;
    while let Some(&c) = chars.get(i) {
        if in_string {
            result.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_significant = Some(c);
            }
            i = i.saturating_add(1);
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                result.push(c);
                last_significant = Some(c);
            }
            ',' => {
                // Look ahead past whitespace for a closer or another comma.
                let mut j = i.saturating_add(1);
                while chars.get(j).is_some_and(|ch| ch.is_whitespace()) {
                    j = j.saturating_add(1);
                }
                let next = chars.get(j).copied();
                let dangling = matches!(next, Some('}' | ']' | ','))
                    || matches!(last_significant, Some('{' | '['));
                if !dangling {
                    result.push(c);
                    last_significant = Some(c);
                }
            }
            _ => {
                result.push(c);
                if !c.is_whitespace() {
                    last_significant = Some(c);
                }
            }
        }
        i = i.saturating_add(1);
    }

    result
}
