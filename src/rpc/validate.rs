use serde_json::Value;

/// Hard cap on tool name length, independent of configuration.
pub const MAX_TOOL_NAME_LEN: usize = 256;

/// Transport-level input limits, enforced before any work happens.
#[derive(Debug, Clone)]
pub struct TransportLimits {
    pub max_body_bytes: usize,
    pub max_arguments_depth: usize,
    pub max_arguments_properties: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            max_arguments_depth: 16,
            max_arguments_properties: 128,
        }
    }
}

/// Tool names: `[A-Za-z0-9_\-./]` with no leading, trailing, or
/// consecutive separators. Dots are the gateway namespace separator and
/// slashes appear in route-derived names; banning runs of either rejects
/// traversal-shaped input like `../../etc/passwd` outright.
pub fn validate_tool_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("tool name must not be empty".to_string());
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(format!(
            "tool name exceeds maximum length of {}",
            MAX_TOOL_NAME_LEN
        ));
    }
    let mut prev_sep = true; // treat start-of-name as a separator boundary
    for c in name.chars() {
        let is_sep = c == '/' || c == '.';
        if is_sep {
            if prev_sep {
                return Err(
                    "tool name must not contain leading, trailing, or consecutive separators"
                        .to_string(),
                );
            }
            prev_sep = true;
            continue;
        }
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(format!("tool name contains invalid character {:?}", c));
        }
        prev_sep = false;
    }
    if name.ends_with('/') || name.ends_with('.') {
        return Err(
            "tool name must not contain leading, trailing, or consecutive separators".to_string(),
        );
    }
    Ok(())
}

/// Nesting depth of a JSON value. A scalar has depth 1.
pub fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}

/// Total number of object properties anywhere in the tree.
pub fn property_count(value: &Value) -> usize {
    match value {
        Value::Object(map) => map.len() + map.values().map(property_count).sum::<usize>(),
        Value::Array(items) => items.iter().map(property_count).sum(),
        _ => 0,
    }
}

/// Check the call arguments against the configured limits.
pub fn validate_arguments(arguments: &Value, limits: &TransportLimits) -> Result<(), String> {
    if json_depth(arguments) > limits.max_arguments_depth {
        return Err(format!(
            "arguments exceed maximum allowed depth of {}",
            limits.max_arguments_depth
        ));
    }
    let count = property_count(arguments);
    if count > limits.max_arguments_properties {
        return Err(format!(
            "arguments exceed maximum allowed count of {} properties",
            limits.max_arguments_properties
        ));
    }
    Ok(())
}
