/// Wildcard allow/deny filter applied to external tool names.
///
/// Patterns are literal, case-sensitive matches where `*` matches any
/// substring: `weather*` (prefix), `*.read` (suffix), `weather*cast`
/// (infix). Compiled once at construction so the per-call check is a few
/// string scans.
pub struct GatewayToolPolicy {
    allowed: Vec<CompiledPattern>,
    denied: Vec<CompiledPattern>,
    deny_by_default: bool,
}

pub(super) struct CompiledPattern {
    /// Literal segments between `*`s, in order.
    segments: Vec<String>,
    anchored_start: bool,
    anchored_end: bool,
}

impl CompiledPattern {
    pub(super) fn compile(pattern: &str) -> Self {
        Self {
            segments: pattern
                .split('*')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            anchored_start: !pattern.starts_with('*'),
            anchored_end: !pattern.ends_with('*'),
        }
    }

    pub(super) fn matches(&self, name: &str) -> bool {
        if self.segments.is_empty() {
            // Pattern was "*" or all stars.
            return true;
        }
        let mut rest = name;
        for (i, segment) in self.segments.iter().enumerate() {
            if i == 0 && self.anchored_start {
                let Some(tail) = rest.strip_prefix(segment.as_str()) else {
                    return false;
                };
                rest = tail;
            } else {
                let Some(at) = rest.find(segment.as_str()) else {
                    return false;
                };
                rest = &rest[at + segment.len()..];
            }
        }
        if self.anchored_end {
            // The final segment must sit at the very end. `rest` is what
            // follows the last matched segment; for a match it must be
            // empty unless a later occurrence of that segment ends the name.
            if rest.is_empty() {
                return true;
            }
            let last = self
                .segments
                .last()
                .expect("segments checked non-empty above");
            if self.segments.len() == 1 && self.anchored_start {
                // Fully anchored single segment: exact equality already
                // decided by the empty-rest check.
                return false;
            }
            return name.ends_with(last.as_str());
        }
        true
    }
}

impl GatewayToolPolicy {
    pub fn new(allowed: &[String], denied: &[String], deny_by_default: bool) -> Self {
        Self {
            allowed: allowed
                .iter()
                .map(|p| CompiledPattern::compile(p))
                .collect(),
            denied: denied.iter().map(|p| CompiledPattern::compile(p)).collect(),
            deny_by_default,
        }
    }

    /// Policy with nothing configured; allows everything.
    pub fn permissive() -> Self {
        Self::new(&[], &[], false)
    }

    /// Whether the policy can affect any decision.
    pub fn is_active(&self) -> bool {
        self.deny_by_default || !self.allowed.is_empty() || !self.denied.is_empty()
    }

    /// Deny wins over allow; `deny_by_default` closes the fallthrough.
    pub fn allows(&self, external_name: &str) -> bool {
        if self.denied.iter().any(|p| p.matches(external_name)) {
            return false;
        }
        if self.deny_by_default && !self.allowed.iter().any(|p| p.matches(external_name)) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allowed: &[&str], denied: &[&str], deny_by_default: bool) -> GatewayToolPolicy {
        let allowed: Vec<String> = allowed.iter().map(|s| (*s).to_string()).collect();
        let denied: Vec<String> = denied.iter().map(|s| (*s).to_string()).collect();
        GatewayToolPolicy::new(&allowed, &denied, deny_by_default)
    }

    #[test]
    fn prefix_pattern_matches_only_prefixed_names() {
        let p = CompiledPattern::compile("weather*");
        assert!(p.matches("weather.get_forecast"));
        assert!(p.matches("weather"));
        assert!(!p.matches("space-weather"));
        assert!(!p.matches("forecast.weather_x"));
    }

    #[test]
    fn suffix_pattern_matches_only_suffixed_names() {
        let p = CompiledPattern::compile("*.read");
        assert!(p.matches("files.read"));
        assert!(p.matches("ns1.db.read"));
        assert!(!p.matches("files.read_all"));
        assert!(!p.matches("read"));
    }

    #[test]
    fn infix_pattern_requires_both_ends() {
        let p = CompiledPattern::compile("a*b");
        assert!(p.matches("ab"));
        assert!(p.matches("a-middle-b"));
        assert!(!p.matches("a-middle"));
        assert!(!p.matches("middle-b"));
        assert!(!p.matches("b-then-a"));
    }

    #[test]
    fn bare_star_matches_anything() {
        let p = CompiledPattern::compile("*");
        assert!(p.matches("anything.at.all"));
        assert!(p.matches(""));
    }

    #[test]
    fn literal_pattern_is_exact_and_case_sensitive() {
        let p = CompiledPattern::compile("weather.get");
        assert!(p.matches("weather.get"));
        assert!(!p.matches("weather.get_forecast"));
        assert!(!p.matches("Weather.get"));
    }

    #[test]
    fn deny_overrides_allow() {
        let p = policy(&["weather*"], &["weather.admin*"], false);
        assert!(p.allows("weather.get_forecast"));
        assert!(!p.allows("weather.admin_reset"));
    }

    #[test]
    fn deny_by_default_requires_an_allow_match() {
        let p = policy(&["weather*"], &[], true);
        assert!(p.allows("weather.get"));
        assert!(!p.allows("files.read"));
    }

    #[test]
    fn inactive_policy_allows_everything() {
        let p = GatewayToolPolicy::permissive();
        assert!(!p.is_active());
        assert!(p.allows("anything"));
    }

    #[test]
    fn active_when_any_pattern_or_default_set() {
        assert!(policy(&["a*"], &[], false).is_active());
        assert!(policy(&[], &["b*"], false).is_active());
        assert!(policy(&[], &[], true).is_active());
    }
}
