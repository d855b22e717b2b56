//! Pattern matching for domain allow/block lists.
//!
//! Grounded in `original_source/utils/utils.go`'s `DomainMatch`: a pattern
//! beginning with `*` matches any domain ending in the suffix after
//! `*.`; any other pattern must equal the domain exactly. The Go version
//! panics on a pattern with more than one `*` — this port rejects such a
//! pattern at match time instead of panicking, since an attacker- or
//! operator-supplied pattern shouldn't be able to take the process down.

/// Returns true if `domain` matches any of `patterns` under the
/// `*.suffix.tld` / exact-match policy.
pub fn domain_match(domain: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| single_pattern_match(domain, p))
}

fn single_pattern_match(domain: &str, pattern: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix('*') {
        if rest.contains('*') {
            return false;
        }
        let suffix = rest.trim_start_matches('.');
        domain == suffix || domain.ends_with(rest)
    } else {
        domain == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_suffix() {
        let patterns = vec!["*.ads.example.com".to_string()];
        assert!(domain_match("x.ads.example.com", &patterns));
        assert!(domain_match("ads.example.com", &patterns));
        assert!(!domain_match("example.com", &patterns));
    }

    #[test]
    fn exact_pattern_requires_exact_match() {
        let patterns = vec!["tracker.example.com".to_string()];
        assert!(domain_match("tracker.example.com", &patterns));
        assert!(!domain_match("sub.tracker.example.com", &patterns));
    }

    #[test]
    fn rejects_multi_star_pattern() {
        let patterns = vec!["*.foo.*.com".to_string()];
        assert!(!domain_match("a.foo.b.com", &patterns));
    }

    #[test]
    fn empty_pattern_list_never_matches() {
        assert!(!domain_match("anything.com", &[]));
    }
}
