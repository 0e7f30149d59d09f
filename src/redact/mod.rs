use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

/// Replacement marker for sanitized values.
pub const REDACTED: &str = "[REDACTED]";

/// Field names whose values are always sanitized, regardless of
/// configuration. Matched case-insensitively.
const BUILTIN_FIELD_NAMES: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "authorization",
    "client_secret",
];

/// Sanitizes successful tool results: field-name matching on JSON content,
/// regex patterns on text content. Patterns are compiled once at
/// construction; a disabled redactor is a no-op the pipeline can skip
/// cheaply.
pub struct Redactor {
    enabled: bool,
    field_names: HashSet<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            field_names: HashSet::new(),
            patterns: Vec::new(),
        }
    }

    /// Build from configured field names and regex patterns. Patterns that
    /// fail to compile are dropped with a warning rather than failing the
    /// host.
    pub fn new(extra_field_names: &[String], patterns: &[String]) -> Self {
        let mut field_names: HashSet<String> = BUILTIN_FIELD_NAMES
            .iter()
            .map(|n| (*n).to_string())
            .collect();
        field_names.extend(extra_field_names.iter().map(|n| n.to_lowercase()));

        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("failed to compile redaction pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();

        Self {
            enabled: true,
            field_names,
            patterns,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Apply regex patterns to text. Returns `None` when nothing matched so
    /// callers can skip the write-back.
    pub fn redact_text(&self, text: &str) -> Option<String> {
        if !self.enabled || self.patterns.is_empty() {
            return None;
        }
        let mut out = text.to_string();
        let mut changed = false;
        for pattern in &self.patterns {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, REDACTED).into_owned();
                changed = true;
            }
        }
        changed.then_some(out)
    }

    /// Replace values of matching field names anywhere in the JSON tree.
    /// Returns whether anything changed.
    pub fn redact_json(&self, value: &mut Value) -> bool {
        if !self.enabled {
            return false;
        }
        self.redact_json_inner(value)
    }

    fn redact_json_inner(&self, value: &mut Value) -> bool {
        match value {
            Value::Object(map) => {
                let mut changed = false;
                for (key, entry) in map.iter_mut() {
                    if self.field_names.contains(&key.to_lowercase()) {
                        if *entry != Value::String(REDACTED.to_string()) {
                            *entry = Value::String(REDACTED.to_string());
                            changed = true;
                        }
                    } else {
                        changed |= self.redact_json_inner(entry);
                    }
                }
                changed
            }
            Value::Array(items) => {
                let mut changed = false;
                for item in items {
                    changed |= self.redact_json_inner(item);
                }
                changed
            }
            Value::String(s) => {
                if let Some(replaced) = self.redact_text(s) {
                    *s = replaced;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}
