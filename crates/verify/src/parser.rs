//! Output extraction and pass conditions.
//!
//! Extractors pull named values out of executor output (regex captures,
//! JSON path lookups); conditions are small comparisons over those values.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Values extracted from output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    /// Extracted values (name -> value)
    pub values: HashMap<String, String>,
}

impl Extracted {
    fn with(name: &str, value: String) -> Self {
        let mut values = HashMap::new();
        values.insert(name.to_string(), value);
        Self { values }
    }

    /// Get a value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.as_str())
    }

    /// Get a value as a boolean.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| match v.to_lowercase().as_str() {
            "true" | "1" | "yes" | "pass" => Some(true),
            "false" | "0" | "no" | "fail" => Some(false),
            _ => None,
        })
    }

    /// Get a value as a float.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.parse().ok())
    }
}

/// Whether the output contains `text` anywhere.
pub fn contains(output: &str, text: &str) -> Result<Extracted, String> {
    if output.contains(text) {
        Ok(Extracted::with("contains", "true".into()))
    } else {
        Err(format!("output does not contain '{}'", text))
    }
}

/// Whether the output does not contain `text`; reports the first offending line.
pub fn not_contains(output: &str, text: &str) -> Result<Extracted, String> {
    match output.lines().position(|line| line.contains(text)) {
        None if !output.contains(text) => Ok(Extracted::with("contains", "false".into())),
        Some(line) => Err(format!("output contains '{}' on line {}", text, line + 1)),
        None => Err(format!("output contains '{}'", text)),
    }
}

/// Match a regex against the output, collecting named captures.
pub fn regex(output: &str, pattern: &str) -> Result<Extracted, String> {
    let re = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
    let captures = re
        .captures(output)
        .ok_or_else(|| format!("output does not match '{}'", pattern))?;

    let mut extracted = Extracted::with("match", "true".into());
    for name in re.capture_names().flatten() {
        if let Some(value) = captures.name(name) {
            extracted.values.insert(name.to_string(), value.as_str().to_string());
        }
    }
    Ok(extracted)
}

/// Parse the output as JSON and resolve `path`, stored as `value`.
///
/// Paths use dot notation with array indexing:
/// - `field`
/// - `field.nested`
/// - `array[0]`
/// - `field.array[0].nested`
pub fn json_path(output: &str, path: &str) -> Result<Extracted, String> {
    let json: JsonValue = serde_json::from_str(output.trim())
        .map_err(|e| format!("output is not valid JSON: {}", e))?;
    let value = navigate(&json, path).ok_or_else(|| format!("path '{}' not found", path))?;
    let rendered = render(value);

    let mut extracted = Extracted::with("value", rendered.clone());
    extracted.values.insert(path.to_string(), rendered);
    Ok(extracted)
}

fn navigate<'a>(json: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = json;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        match part.find('[') {
            Some(open) => {
                let key = &part[..open];
                if !key.is_empty() {
                    current = current.get(key)?;
                }
                // `a[0][1]` style chains
                for index in part[open..].split('[').filter(|s| !s.is_empty()) {
                    let index: usize = index.strip_suffix(']')?.parse().ok()?;
                    current = current.get(index)?;
                }
            }
            None => current = current.get(part)?,
        }
    }
    Some(current)
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => "null".to_string(),
        JsonValue::Array(_) | JsonValue::Object(_) => value.to_string(),
    }
}

/// Evaluate a condition against extracted values.
///
/// Accepted forms:
/// - `true` / `false`
/// - `name` (truthy when present and non-empty)
/// - `name == x`, `name != x` (string comparison, surrounding quotes dropped)
/// - `name > n`, `>=`, `<`, `<=` (numeric when both sides parse)
pub fn evaluate_condition(condition: &str, values: &Extracted) -> bool {
    let condition = condition.trim();
    match condition {
        "true" => return true,
        "false" | "" => return false,
        _ => {}
    }

    let Some((name, op, expected)) = split_condition(condition) else {
        return match values.get(condition) {
            Some(value) => values.get_bool(condition).unwrap_or(!value.is_empty()),
            None => false,
        };
    };
    let expected = expected.trim_matches('"');
    let Some(actual) = values.get(name) else {
        return false;
    };

    match op {
        "==" => actual == expected,
        "!=" => actual != expected,
        _ => {
            let ordering = match (actual.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(actual.cmp(expected)),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                _ => false,
            }
        }
    }
}

fn split_condition(condition: &str) -> Option<(&str, &str, &str)> {
    // Two-character operators first so `>=` is not read as `>`.
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(idx) = condition.find(op) {
            let name = condition[..idx].trim();
            let rest = condition[idx + op.len()..].trim();
            return Some((name, op, rest));
        }
    }
    None
}
