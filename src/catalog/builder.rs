use chrono::Utc;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::policy::{self, PolicyDocument};

use super::{CatalogSnapshot, EndpointDescriptor, ToolDescriptor};

/// Join a policy document with a set of endpoint descriptors into a fresh
/// snapshot. Disabled tools are omitted entirely. A descriptor that cannot
/// be resolved is skipped (denied) unless `deny_on_evaluation_failure` is
/// off, in which case it falls through to the document default.
pub fn build_snapshot(
    document: &PolicyDocument,
    endpoints: &[EndpointDescriptor],
    deny_on_evaluation_failure: bool,
) -> CatalogSnapshot {
    let mut tools: IndexMap<String, ToolDescriptor> = IndexMap::with_capacity(endpoints.len());

    for descriptor in endpoints {
        let effective = match policy::resolve(document, descriptor) {
            Ok(p) => p,
            Err(e) if deny_on_evaluation_failure => {
                warn!("catalog build: skipping endpoint: {}", e);
                continue;
            }
            Err(e) => {
                warn!("catalog build: endpoint kept with default policy: {}", e);
                crate::policy::EffectivePolicy {
                    enabled: !document.deny_by_default,
                    ..crate::policy::EffectivePolicy::default_allow()
                }
            }
        };
        if !effective.enabled {
            debug!(
                "catalog build: endpoint {:?} disabled (source {:?})",
                descriptor.operation_id, effective.source
            );
            continue;
        }

        let tool_name = canonical_tool_name(descriptor);
        if tool_name.is_empty() {
            warn!("catalog build: endpoint has no usable name, skipping");
            continue;
        }
        if tools.contains_key(&tool_name) {
            warn!(
                "catalog build: duplicate tool name '{}', last definition wins",
                tool_name
            );
        }
        tools.insert(
            tool_name.clone(),
            ToolDescriptor {
                tool_name,
                description: descriptor.description.clone(),
                input_schema: descriptor.input_schema.clone(),
                endpoint: descriptor.clone(),
                effective_policy: effective,
            },
        );
    }

    CatalogSnapshot {
        created_utc: Utc::now(),
        policy_source_version: document.source_version.clone(),
        tools,
    }
}

/// Canonical tool name: prefer the operation id, else a slug of
/// `method_route`, else the display name (slugged).
fn canonical_tool_name(descriptor: &EndpointDescriptor) -> String {
    if let Some(op) = &descriptor.operation_id {
        return op.clone();
    }
    if let Some(route) = &descriptor.route_template {
        let method = descriptor.http_method.as_deref().unwrap_or("GET");
        return slug(&format!("{}_{}", method.to_lowercase(), route));
    }
    descriptor
        .display_name
        .as_deref()
        .map(slug)
        .unwrap_or_default()
}

/// Collapse anything outside `[A-Za-z0-9_-]` into single underscores and
/// trim them from the ends.
fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyEntry;

    fn endpoint(op: &str) -> EndpointDescriptor {
        EndpointDescriptor {
            operation_id: Some(op.to_string()),
            http_method: Some("GET".to_string()),
            ..EndpointDescriptor::default()
        }
    }

    #[test]
    fn slug_sanitizes_route_templates() {
        assert_eq!(slug("get_/users/{id}"), "get_users_id");
        assert_eq!(slug("post_/orders"), "post_orders");
        assert_eq!(slug("Weird  Name!"), "Weird_Name");
    }

    #[test]
    fn tool_name_prefers_operation_id() {
        let d = EndpointDescriptor {
            operation_id: Some("GetUser".to_string()),
            route_template: Some("/users/{id}".to_string()),
            display_name: Some("Get User".to_string()),
            http_method: Some("GET".to_string()),
            ..EndpointDescriptor::default()
        };
        assert_eq!(canonical_tool_name(&d), "GetUser");
    }

    #[test]
    fn tool_name_falls_back_to_method_route_slug() {
        let d = EndpointDescriptor {
            route_template: Some("/users/{id}".to_string()),
            http_method: Some("GET".to_string()),
            display_name: Some("Get User".to_string()),
            ..EndpointDescriptor::default()
        };
        assert_eq!(canonical_tool_name(&d), "get_users_id");
    }

    #[test]
    fn disabled_tools_are_omitted() {
        let doc = PolicyDocument {
            deny_by_default: true,
            allow: vec![PolicyEntry {
                operation_id: Some("GetUser".to_string()),
                ..PolicyEntry::default()
            }],
            ..PolicyDocument::default()
        };
        let snapshot = build_snapshot(&doc, &[endpoint("GetUser"), endpoint("DeleteUser")], true);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("GetUser").is_some());
        assert!(snapshot.get("DeleteUser").is_none());
    }

    #[test]
    fn duplicate_names_last_wins() {
        let doc = PolicyDocument::default();
        let mut first = endpoint("GetUser");
        first.description = Some("first".to_string());
        let mut second = endpoint("GetUser");
        second.description = Some("second".to_string());

        let snapshot = build_snapshot(&doc, &[first, second], true);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get("GetUser").unwrap().description.as_deref(),
            Some("second")
        );
    }

    #[test]
    fn unidentifiable_descriptor_is_skipped() {
        let doc = PolicyDocument::default();
        let blank = EndpointDescriptor::default();
        let snapshot = build_snapshot(&doc, &[blank, endpoint("GetUser")], true);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn evaluation_failure_fallback_keeps_named_endpoints() {
        let doc = PolicyDocument::default();
        // Identifiable for naming purposes is still required; a blank
        // descriptor stays out either way.
        let blank = EndpointDescriptor::default();
        let snapshot = build_snapshot(&doc, &[blank, endpoint("GetUser")], false);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("GetUser").is_some());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let doc = PolicyDocument::default();
        let snapshot = build_snapshot(&doc, &[endpoint("B"), endpoint("A"), endpoint("C")], true);
        let names: Vec<&str> = snapshot.tools.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }

    #[test]
    fn snapshot_records_source_version() {
        let doc = PolicyDocument {
            source_version: "mtime-123".to_string(),
            ..PolicyDocument::default()
        };
        let snapshot = build_snapshot(&doc, &[endpoint("GetUser")], true);
        assert_eq!(snapshot.policy_source_version, "mtime-123");
    }
}
