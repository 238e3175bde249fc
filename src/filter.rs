//! Repository name filtering
//!
//! Include and exclude lists are regular expressions matched anywhere in the
//! repository name. An empty include list matches every name.

use anyhow::{Context, Result};
use regex::Regex;

/// Compiled form of a mirror's filter configuration
#[derive(Debug, Clone, Default)]
pub struct FilterMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    only_archived: bool,
}

impl FilterMatcher {
    /// Compile include/exclude patterns. Any invalid pattern is an error.
    pub fn new(include: &[String], exclude: &[String], only_archived: bool) -> Result<Self> {
        Ok(Self {
            include: compile_all(include, "include")?,
            exclude: compile_all(exclude, "exclude")?,
            only_archived,
        })
    }

    /// True if there is no include list or any include pattern matches
    pub fn matches_inclusion(&self, name: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(name))
    }

    /// True if any exclude pattern matches
    pub fn matches_exclusion(&self, name: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(name))
    }

    /// Full predicate applied to every enumerated repository
    pub fn matches(&self, name: &str, archived: bool) -> bool {
        self.matches_inclusion(name)
            && !self.matches_exclusion(name)
            && (!self.only_archived || archived)
    }
}

fn compile_all(patterns: &[String], kind: &str) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .with_context(|| format!("Invalid {} pattern: {:?}", kind, pattern))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn matcher(include: &[&str], exclude: &[&str], only_archived: bool) -> FilterMatcher {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        FilterMatcher::new(&include, &exclude, only_archived).expect("valid patterns")
    }

    #[test]
    fn test_include_and_exclude() {
        let filter = matcher(&["^web-"], &["-deprecated$"], false);

        assert!(filter.matches("web-app", false));
        assert!(!filter.matches("web-app-deprecated", false));
        assert!(!filter.matches("api-app", false));
    }

    #[test]
    fn test_empty_include_matches_everything() {
        let filter = FilterMatcher::default();

        assert!(filter.matches("anything", false));
        assert!(filter.matches("", true));
    }

    #[test]
    fn test_patterns_are_unanchored() {
        let filter = matcher(&["tool"], &[], false);

        assert!(filter.matches("my-tool-kit", false));
        assert!(!filter.matches("library", false));
    }

    #[test]
    fn test_only_archived() {
        let filter = matcher(&[], &[], true);

        assert!(filter.matches("old", true));
        assert!(!filter.matches("current", false));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = matcher(&["app"], &["app"], false);
        assert!(!filter.matches("app", false));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = FilterMatcher::new(&["(unclosed".to_string()], &[], false);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("include"));
    }

    #[quickcheck]
    fn prop_matches_follows_filter_law(name: String, archived: bool, only_archived: bool) -> bool {
        let include = ["^web-", "x"];
        let exclude = ["-deprecated$", "[0-9]"];
        let filter = matcher(&include, &exclude, only_archived);

        let included = include.iter().any(|p| Regex::new(p).unwrap().is_match(&name));
        let excluded = exclude.iter().any(|p| Regex::new(p).unwrap().is_match(&name));
        let expected = included && !excluded && (!only_archived || archived);

        filter.matches(&name, archived) == expected
    }

    #[quickcheck]
    fn prop_no_patterns_only_checks_archived(name: String, archived: bool) -> bool {
        let filter = matcher(&[], &[], true);
        filter.matches(&name, archived) == archived
    }
}
