use super::*;
use crate::policy::PolicyEntry;

fn descriptor(op: Option<&str>, route: Option<&str>, name: Option<&str>) -> EndpointDescriptor {
    EndpointDescriptor {
        operation_id: op.map(String::from),
        route_template: route.map(String::from),
        display_name: name.map(String::from),
        http_method: Some("GET".to_string()),
        ..EndpointDescriptor::default()
    }
}

fn allow_entry(op: &str) -> PolicyEntry {
    PolicyEntry {
        operation_id: Some(op.to_string()),
        ..PolicyEntry::default()
    }
}

#[test]
fn unmatched_descriptor_follows_deny_by_default() {
    let open = PolicyDocument::default();
    let closed = PolicyDocument {
        deny_by_default: true,
        ..PolicyDocument::default()
    };
    let d = descriptor(Some("GetUser"), None, None);

    let resolved = resolve(&open, &d).unwrap();
    assert!(resolved.enabled);
    assert_eq!(resolved.source, ResolutionSource::Default);
    assert!(resolved.timeout.is_none());

    let resolved = resolve(&closed, &d).unwrap();
    assert!(!resolved.enabled);
    assert_eq!(resolved.source, ResolutionSource::Default);
}

#[test]
fn deny_overrides_allow_when_both_match() {
    let doc = PolicyDocument {
        allow: vec![allow_entry("GetUser")],
        deny: vec![allow_entry("GetUser")],
        ..PolicyDocument::default()
    };
    let resolved = resolve(&doc, &descriptor(Some("GetUser"), None, None)).unwrap();
    assert!(!resolved.enabled);
    assert_eq!(resolved.source, ResolutionSource::Deny);
}

#[test]
fn allow_entry_settings_are_applied() {
    let doc = PolicyDocument {
        deny_by_default: true,
        allow: vec![PolicyEntry {
            operation_id: Some("GetUser".to_string()),
            method: Some("GET".to_string()),
            timeout_ms: Some(5_000),
            concurrency_limit: Some(2),
            ..PolicyEntry::default()
        }],
        ..PolicyDocument::default()
    };
    let resolved = resolve(&doc, &descriptor(Some("GetUser"), None, None)).unwrap();
    assert!(resolved.enabled);
    assert_eq!(resolved.source, ResolutionSource::Allow);
    assert_eq!(resolved.timeout, Some(Duration::from_millis(5_000)));
    assert_eq!(resolved.concurrency_limit, Some(2));
}

#[test]
fn operation_id_match_beats_route_template() {
    let doc = PolicyDocument {
        allow: vec![
            PolicyEntry {
                route_template: Some("/users/{id}".to_string()),
                timeout_ms: Some(1_000),
                ..PolicyEntry::default()
            },
            PolicyEntry {
                operation_id: Some("GetUser".to_string()),
                timeout_ms: Some(9_000),
                ..PolicyEntry::default()
            },
        ],
        ..PolicyDocument::default()
    };
    let d = descriptor(Some("GetUser"), Some("/users/{id}"), None);
    let resolved = resolve(&doc, &d).unwrap();
    assert_eq!(resolved.timeout, Some(Duration::from_millis(9_000)));
}

#[test]
fn route_template_match_beats_display_name() {
    let doc = PolicyDocument {
        allow: vec![
            PolicyEntry {
                display_name: Some("Get User".to_string()),
                timeout_ms: Some(1_000),
                ..PolicyEntry::default()
            },
            PolicyEntry {
                route_template: Some("/users/{id}".to_string()),
                timeout_ms: Some(9_000),
                ..PolicyEntry::default()
            },
        ],
        ..PolicyDocument::default()
    };
    let d = descriptor(None, Some("/users/{id}"), Some("Get User"));
    let resolved = resolve(&doc, &d).unwrap();
    assert_eq!(resolved.timeout, Some(Duration::from_millis(9_000)));
}

#[test]
fn first_allow_match_wins_within_a_tier() {
    let doc = PolicyDocument {
        allow: vec![
            PolicyEntry {
                operation_id: Some("GetUser".to_string()),
                timeout_ms: Some(1_000),
                ..PolicyEntry::default()
            },
            PolicyEntry {
                operation_id: Some("GetUser".to_string()),
                timeout_ms: Some(9_000),
                ..PolicyEntry::default()
            },
        ],
        ..PolicyDocument::default()
    };
    let resolved = resolve(&doc, &descriptor(Some("GetUser"), None, None)).unwrap();
    assert_eq!(resolved.timeout, Some(Duration::from_millis(1_000)));
}

#[test]
fn selector_comparison_is_case_sensitive() {
    let doc = PolicyDocument {
        deny_by_default: true,
        allow: vec![allow_entry("getuser")],
        ..PolicyDocument::default()
    };
    let resolved = resolve(&doc, &descriptor(Some("GetUser"), None, None)).unwrap();
    assert!(!resolved.enabled);
    assert_eq!(resolved.source, ResolutionSource::Default);
}

#[test]
fn method_mismatch_skips_entry() {
    let doc = PolicyDocument {
        deny_by_default: true,
        allow: vec![PolicyEntry {
            operation_id: Some("GetUser".to_string()),
            method: Some("POST".to_string()),
            ..PolicyEntry::default()
        }],
        ..PolicyDocument::default()
    };
    let resolved = resolve(&doc, &descriptor(Some("GetUser"), None, None)).unwrap();
    assert_eq!(resolved.source, ResolutionSource::Default);
}

#[test]
fn allow_entry_can_disable_a_tool() {
    let doc = PolicyDocument {
        allow: vec![PolicyEntry {
            operation_id: Some("GetUser".to_string()),
            enabled: false,
            ..PolicyEntry::default()
        }],
        ..PolicyDocument::default()
    };
    let resolved = resolve(&doc, &descriptor(Some("GetUser"), None, None)).unwrap();
    assert!(!resolved.enabled);
    assert_eq!(resolved.source, ResolutionSource::Allow);
}

#[test]
fn unidentifiable_descriptor_is_an_error() {
    let doc = PolicyDocument::default();
    let d = EndpointDescriptor {
        http_method: Some("GET".to_string()),
        ..EndpointDescriptor::default()
    };
    let err = resolve(&doc, &d).unwrap_err();
    assert!(err.to_string().contains("invalid descriptor"));
}
