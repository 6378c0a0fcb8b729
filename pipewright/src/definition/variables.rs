//! `{{name}}` and `{{name | default}}` placeholder substitution.

use crate::errors::ConfigError;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Variables available to placeholders.
pub type Variables = BTreeMap<String, Value>;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*(?:\|\s*([^}]*?)\s*)?\}\}")
            .expect("placeholder pattern is a valid regex")
    })
}

/// Substitutes placeholders throughout a JSON document in place.
///
/// A string that consists of exactly one placeholder takes the variable's
/// JSON value, so `"{{chapters}}"` with `chapters = 3` becomes the number 3.
/// Placeholders embedded in longer strings are rendered as text.
///
/// # Errors
///
/// Returns [`ConfigError::UnresolvedVariable`] for a placeholder with neither
/// a value nor a default.
pub fn substitute(value: &mut Value, vars: &Variables) -> Result<(), ConfigError> {
    substitute_at(value, vars, "$")
}

fn substitute_at(value: &mut Value, vars: &Variables, location: &str) -> Result<(), ConfigError> {
    match value {
        Value::String(text) => {
            if let Some(replacement) = render(text, vars, location)? {
                *value = replacement;
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                substitute_at(item, vars, &format!("{location}[{i}]"))?;
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                substitute_at(item, vars, &format!("{location}.{key}"))?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Renders a single string. Returns `None` when it holds no placeholder.
fn render(text: &str, vars: &Variables, location: &str) -> Result<Option<Value>, ConfigError> {
    let re = placeholder();
    if !re.is_match(text) {
        return Ok(None);
    }

    if let Some(caps) = re.captures(text) {
        if caps.get(0).is_some_and(|m| m.as_str() == text) {
            return resolve(&caps, vars, location).map(Some);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        match resolve(&caps, vars, location)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(Some(Value::String(out)))
}

fn resolve(caps: &regex::Captures<'_>, vars: &Variables, location: &str) -> Result<Value, ConfigError> {
    let name = caps.get(1).map_or("", |m| m.as_str());
    if let Some(v) = vars.get(name) {
        return Ok(v.clone());
    }
    if let Some(default) = caps.get(2) {
        return Ok(Value::String(default.as_str().to_string()));
    }
    Err(ConfigError::UnresolvedVariable {
        name: name.to_string(),
        location: location.to_string(),
    })
}

/// Parses `name=value` CLI pairs. Values that parse as JSON keep their type.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for a pair without `=`.
pub fn parse_assignments<I, S>(pairs: I) -> Result<Variables, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut vars = Variables::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (name, raw) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("expected name=value, got '{pair}'")))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        vars.insert(name.trim().to_string(), value);
    }
    Ok(vars)
}
