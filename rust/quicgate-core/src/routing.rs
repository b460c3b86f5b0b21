//! Domain-suffix routing
//!
//! Rules are stored in a trie keyed by reversed dot-separated labels, so
//! `google.com` becomes `com -> google` and matches itself plus any deeper
//! subdomain in O(labels). The tree is built during `start()` and never
//! mutated afterwards; sessions share it through an `Arc` with no locking.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use crate::config::RuleSource;
use crate::error::Result;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    terminal: bool,
}

/// Suffix-match router over a frozen rule set.
#[derive(Debug, Default)]
pub struct SuffixRouter {
    root: TrieNode,
    rules: usize,
}

impl SuffixRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a router from an optional rule source. A missing rule file is
    /// not an error; the router just stays empty.
    pub fn from_source(source: Option<&RuleSource>) -> Result<Self> {
        let mut router = Self::new();
        match source {
            Some(RuleSource::File(path)) => router.load_file(path)?,
            Some(RuleSource::Inline(text)) => router.load_str(text),
            None => {}
        }
        Ok(router)
    }

    /// Insert one rule. Empty input and duplicate rules are ignored.
    pub fn add_rule(&mut self, domain: &str) {
        let labels = split_labels(domain);
        if labels.is_empty() {
            return;
        }

        let mut node = &mut self.root;
        for label in labels.iter().rev() {
            node = node.children.entry(label.clone()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.rules += 1;
        }
    }

    /// Walk the host's labels right-to-left. Any terminal node reached on
    /// the way down means some rule is a suffix of the host.
    pub fn should_proxy(&self, host: &str) -> bool {
        let labels = split_labels(host);
        if labels.is_empty() {
            return false;
        }

        let mut node = &self.root;
        for label in labels.iter().rev() {
            if node.terminal {
                return true;
            }
            match node.children.get(label) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.terminal
    }

    pub fn rule_count(&self) -> usize {
        self.rules
    }

    /// Load rules from newline-separated text. `#` starts a comment; blank
    /// lines are skipped.
    pub fn load_str(&mut self, text: &str) {
        for line in text.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.add_rule(line);
        }
    }

    /// Load rules from a file. A file that does not exist leaves the
    /// router empty and returns `Ok`.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.load_str(&text);
        Ok(())
    }
}

/// Normalize a domain and split it into labels: lowercase, trim, strip one
/// trailing dot, drop empty labels.
fn split_labels(domain: &str) -> Vec<String> {
    let domain = domain.trim().to_lowercase();
    let domain = domain.strip_suffix('.').unwrap_or(&domain);
    domain
        .split('.')
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(rules: &[&str]) -> SuffixRouter {
        let mut router = SuffixRouter::new();
        for rule in rules {
            router.add_rule(rule);
        }
        router
    }

    #[test]
    fn rule_matches_itself_and_subdomains() {
        let router = router_with(&["google.com"]);
        assert!(router.should_proxy("google.com"));
        assert!(router.should_proxy("www.google.com"));
        assert!(router.should_proxy("deep.maps.google.com"));
    }

    #[test]
    fn sibling_domains_do_not_match() {
        let router = router_with(&["google.com"]);
        assert!(!router.should_proxy("evilgoogle.com"));
        assert!(!router.should_proxy("google.net"));
        assert!(!router.should_proxy("com"));
    }

    #[test]
    fn more_specific_rule_does_not_widen_match() {
        let router = router_with(&["evilgoogle.com"]);
        assert!(!router.should_proxy("google.com"));
        assert!(router.should_proxy("evilgoogle.com"));
    }

    #[test]
    fn empty_inputs() {
        let mut router = SuffixRouter::new();
        router.add_rule("");
        router.add_rule("   ");
        assert_eq!(router.rule_count(), 0);
        assert!(!router.should_proxy(""));
        assert!(!router.should_proxy("example.com"));
    }

    #[test]
    fn normalization() {
        let router = router_with(&["  ExAmPle.COM.  "]);
        assert!(router.should_proxy("example.com"));
        assert!(router.should_proxy("WWW.EXAMPLE.COM."));
    }

    #[test]
    fn duplicate_rules_counted_once() {
        let router = router_with(&["example.com", "example.com", "EXAMPLE.com."]);
        assert_eq!(router.rule_count(), 1);
    }

    #[test]
    fn single_label_rule() {
        let router = router_with(&["test"]);
        assert!(router.should_proxy("test"));
        assert!(router.should_proxy("anything.test"));
        assert!(!router.should_proxy("testing"));
    }

    #[test]
    fn ip_literal_rules_match_exactly() {
        let router = router_with(&["10.0.0.1"]);
        assert!(router.should_proxy("10.0.0.1"));
        assert!(!router.should_proxy("10.0.0.2"));
    }

    #[test]
    fn load_str_skips_comments_and_blanks() {
        let mut router = SuffixRouter::new();
        router.load_str("# whitelist\n\nexample.com\n  other.test # inline note\n\n");
        assert_eq!(router.rule_count(), 2);
        assert!(router.should_proxy("example.com"));
        assert!(router.should_proxy("sub.other.test"));
        assert!(!router.should_proxy("whitelist"));
    }

    #[test]
    fn missing_rule_file_is_not_an_error() {
        let mut router = SuffixRouter::new();
        router
            .load_file(Path::new("/nonexistent/quicgate-rules.txt"))
            .unwrap();
        assert_eq!(router.rule_count(), 0);
    }

    #[test]
    fn from_inline_source() {
        let source = RuleSource::Inline("example.com\nexample.org".into());
        let router = SuffixRouter::from_source(Some(&source)).unwrap();
        assert_eq!(router.rule_count(), 2);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_domain() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(\\.[a-z]{1,8}){1,3}"
    }

    fn arb_label() -> impl Strategy<Value = String> {
        "[a-z]{1,8}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_rule_matches_itself(rule in arb_domain()) {
            let mut router = SuffixRouter::new();
            router.add_rule(&rule);
            prop_assert!(router.should_proxy(&rule));
            prop_assert!(router.should_proxy(&rule.to_uppercase()));
        }

        #[test]
        fn prop_rule_matches_any_subdomain(rule in arb_domain(), sub in arb_label()) {
            let mut router = SuffixRouter::new();
            router.add_rule(&rule);
            let host = format!("{}.{}", sub, rule);
            prop_assert!(router.should_proxy(&host));
        }

        #[test]
        fn prop_concatenated_label_does_not_match(rule in arb_domain(), prefix in arb_label()) {
            let mut router = SuffixRouter::new();
            router.add_rule(&rule);
            // prefix glued onto the first label without a dot is a
            // different host
            let host = format!("{}{}", prefix, rule);
            prop_assert!(!router.should_proxy(&host));
        }

        #[test]
        fn prop_empty_tree_matches_nothing(host in arb_domain()) {
            let router = SuffixRouter::new();
            prop_assert!(!router.should_proxy(&host));
        }
    }
}
