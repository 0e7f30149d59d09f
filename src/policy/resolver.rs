use std::time::Duration;

use crate::catalog::EndpointDescriptor;
use crate::errors::{ContextifyError, ContextifyResult};
use crate::ratelimit::Quota;

use super::{AuthPropagationMode, PolicyDocument, PolicyEntry};

/// Which rule produced the effective policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Allow,
    Deny,
    Default,
}

/// Per-tool settings after resolving an endpoint descriptor against the
/// policy document.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub enabled: bool,
    pub timeout: Option<Duration>,
    pub concurrency_limit: Option<u32>,
    pub auth_propagation: AuthPropagationMode,
    pub rate_limit: Option<Quota>,
    pub source: ResolutionSource,
}

impl EffectivePolicy {
    /// The policy an unmatched descriptor gets when the document allows by
    /// default: enabled, no per-tool settings.
    pub fn default_allow() -> Self {
        Self {
            enabled: true,
            timeout: None,
            concurrency_limit: None,
            auth_propagation: AuthPropagationMode::None,
            rate_limit: None,
            source: ResolutionSource::Default,
        }
    }

    fn denied() -> Self {
        Self {
            enabled: false,
            ..Self::default_allow()
        }
    }

    fn from_entry(entry: &PolicyEntry, source: ResolutionSource) -> Self {
        Self {
            enabled: entry.enabled,
            timeout: entry.timeout_ms.map(Duration::from_millis),
            concurrency_limit: entry.concurrency_limit,
            auth_propagation: entry.auth_propagation_mode.unwrap_or_default(),
            rate_limit: entry.rate_limit.clone(),
            source,
        }
    }
}

/// Find the entry matching a descriptor, honoring selector priority:
/// operation id beats route template beats display name. Within one
/// priority tier the first entry in list order wins.
fn find_match<'a>(
    entries: &'a [PolicyEntry],
    descriptor: &EndpointDescriptor,
) -> Option<&'a PolicyEntry> {
    let method = descriptor.http_method.as_deref();

    if let Some(op) = &descriptor.operation_id
        && let Some(entry) = entries
            .iter()
            .find(|e| e.operation_id.as_ref() == Some(op) && e.method_matches(method))
    {
        return Some(entry);
    }
    if let Some(route) = &descriptor.route_template
        && let Some(entry) = entries
            .iter()
            .find(|e| e.route_template.as_ref() == Some(route) && e.method_matches(method))
    {
        return Some(entry);
    }
    if let Some(name) = &descriptor.display_name
        && let Some(entry) = entries
            .iter()
            .find(|e| e.display_name.as_ref() == Some(name) && e.method_matches(method))
    {
        return Some(entry);
    }
    None
}

/// Resolve one endpoint descriptor against the policy document.
///
/// Deny always overrides allow, even when both match. A descriptor
/// matching neither list falls through to the document default.
pub fn resolve(
    document: &PolicyDocument,
    descriptor: &EndpointDescriptor,
) -> ContextifyResult<EffectivePolicy> {
    if !descriptor.is_identifiable() {
        return Err(ContextifyError::Policy(
            "invalid descriptor: no operationId, routeTemplate, or displayName".to_string(),
        ));
    }

    if find_match(&document.deny, descriptor).is_some() {
        return Ok(EffectivePolicy {
            source: ResolutionSource::Deny,
            ..EffectivePolicy::denied()
        });
    }

    if let Some(entry) = find_match(&document.allow, descriptor) {
        return Ok(EffectivePolicy::from_entry(entry, ResolutionSource::Allow));
    }

    Ok(EffectivePolicy {
        enabled: !document.deny_by_default,
        ..EffectivePolicy::default_allow()
    })
}

#[cfg(test)]
mod tests;
