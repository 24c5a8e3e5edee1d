// Generative Output Parser
// Bounded salvage of flag JSON from free-form model replies

use crate::models::Flag;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)```").expect("static regex must compile"))
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static regex must compile"))
}

fn strict(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

fn fenced(text: &str) -> Option<String> {
    fenced_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Outermost `[...]` or `{...}` span, whichever opens first.
fn substring(text: &str) -> Option<&str> {
    let span = |open: char, close: char| {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        (end > start).then_some((start, end))
    };
    let best = match (span('[', ']'), span('{', '}')) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }?;
    Some(&text[best.0..=best.1])
}

fn repair(text: &str) -> String {
    let cleaned = text
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    trailing_comma_re().replace_all(&cleaned, "$1").to_string()
}

/// Strict parse, then fenced block, then bracket substring, then light repair.
///
/// `None` means nothing JSON-shaped could be recovered.
pub fn extract_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    if let Some(v) = strict(text) {
        return Some(v);
    }
    let body = fenced(text).unwrap_or_else(|| text.to_string());
    if let Some(v) = strict(&body) {
        return Some(v);
    }
    let candidate = substring(&body).unwrap_or(&body).to_string();
    if let Some(v) = strict(&candidate) {
        return Some(v);
    }
    strict(&repair(&candidate))
}

fn first_str<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn as_index(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn indexes_of(obj: &serde_json::Map<String, Value>) -> Vec<i64> {
    for key in ["sentence_indexes", "sentence_indices", "indexes", "indices", "sentences", "sentence_index"] {
        match obj.get(key) {
            Some(Value::Array(items)) => return items.iter().filter_map(as_index).collect(),
            Some(single) => {
                if let Some(i) = as_index(single) {
                    return vec![i];
                }
            }
            None => {}
        }
    }
    vec![]
}

fn flag_from_object(obj: &serde_json::Map<String, Value>) -> Option<Flag> {
    let category = first_str(obj, &["category", "type", "label"])?;
    let rationale = first_str(obj, &["rationale", "why", "reason", "explanation"]).unwrap_or("");
    Some(Flag::new(category, indexes_of(obj), rationale))
}

/// Flags from a salvaged JSON value: a list, a `{"flags": [...]}` wrapper, or one object.
pub fn flags_from_value(value: &Value) -> Vec<Flag> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(obj) => match obj.get("flags") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => vec![value],
        },
        _ => vec![],
    };
    items
        .into_iter()
        .filter_map(Value::as_object)
        .filter_map(flag_from_object)
        .collect()
}

/// `None` when the reply is unparseable; `Some(vec![])` when it parsed to no flags.
pub fn parse_flag_output(text: &str) -> Option<Vec<Flag>> {
    extract_json(text).map(|v| flags_from_value(&v))
}
