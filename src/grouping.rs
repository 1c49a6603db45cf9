//! Mapping fully-qualified test names to parent grouping keys.
//!
//! Results that share a grouping key are reported under one remote parent
//! record. With class grouping enabled the key is the class
//! (`Namespace.Class`); without it the key is the full remaining name, so
//! every method gets its own parent and reruns of that method stack up
//! under it.

use serde::{Deserialize, Serialize};

/// How rerun attempts are recorded under an existing parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RerunPolicy {
    /// Report only the new attempt as a sub-result.
    #[default]
    LatestOnly,

    /// On the first rerun of a parent whose first attempt failed, also copy
    /// that first attempt as a `#1` sub-result so the failure stays visible.
    PreserveFirstFailure,
}

/// Derives grouping keys from fully-qualified test names.
///
/// # Example
///
/// ```
/// use runfeed::grouping::ResultGrouper;
///
/// let grouper = ResultGrouper::new(true).with_source("Foo");
/// assert_eq!(grouper.parent_key("Foo.BarTests.Test1"), "BarTests");
/// assert_eq!(grouper.parent_key("Other.BarTests.Test1"), "Other.BarTests");
///
/// let flat = ResultGrouper::new(false).with_source("Foo");
/// assert_eq!(flat.parent_key("Foo.BarTests.Test1"), "BarTests.Test1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultGrouper {
    source: Option<String>,
    group_by_class: bool,
}

impl ResultGrouper {
    pub fn new(group_by_class: bool) -> Self {
        Self {
            source: None,
            group_by_class,
        }
    }

    /// Sets the namespace prefix stripped from every name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        let source = source.into();
        self.source = if source.is_empty() { None } else { Some(source) };
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn groups_by_class(&self) -> bool {
        self.group_by_class
    }

    /// Returns the grouping key for `name`.
    pub fn parent_key(&self, name: &str) -> String {
        let name = self.strip_source(name);

        if !self.group_by_class {
            return name.to_string();
        }

        // Dots inside the argument list (`Method(1.5)`) are not separators.
        let method_end = name.find('(').unwrap_or(name.len());
        match name[..method_end].rfind('.') {
            Some(dot) => name[..dot].to_string(),
            // No class segment to group by.
            None => name.to_string(),
        }
    }

    fn strip_source<'a>(&self, name: &'a str) -> &'a str {
        self.source
            .as_deref()
            .and_then(|source| name.strip_prefix(source))
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_grouping_strips_method() {
        let grouper = ResultGrouper::new(true);
        assert_eq!(grouper.parent_key("Ns.Sub.Class.Method"), "Ns.Sub.Class");
    }

    #[test]
    fn test_class_grouping_ignores_dots_in_arguments() {
        let grouper = ResultGrouper::new(true);
        assert_eq!(
            grouper.parent_key("Ns.Class.Method(1.5, \"a.b\")"),
            "Ns.Class"
        );
    }

    #[test]
    fn test_source_prefix_requires_segment_boundary() {
        let grouper = ResultGrouper::new(true).with_source("Foo");
        // "FooBar" merely starts with "Foo"; it is a different namespace.
        assert_eq!(grouper.parent_key("FooBar.Tests.T1"), "FooBar.Tests");
        assert_eq!(grouper.parent_key("Foo.Tests.T1"), "Tests");
    }

    #[test]
    fn test_flat_grouping_keeps_arguments() {
        let grouper = ResultGrouper::new(false).with_source("Foo");
        assert_eq!(grouper.parent_key("Foo.Tests.T1(2)"), "Tests.T1(2)");
    }

    #[test]
    fn test_name_without_class_is_its_own_key() {
        let grouper = ResultGrouper::new(true);
        assert_eq!(grouper.parent_key("Lonely"), "Lonely");
        assert_eq!(grouper.parent_key("Lonely(1.2)"), "Lonely(1.2)");
    }

    #[test]
    fn test_empty_source_is_ignored() {
        let grouper = ResultGrouper::new(true).with_source("");
        assert_eq!(grouper.source(), None);
        assert_eq!(grouper.parent_key("A.B.C"), "A.B");
    }

    #[test]
    fn test_rerun_policy_parses_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: RerunPolicy,
        }
        let w: Wrapper = toml::from_str(r#"policy = "preserve-first-failure""#).unwrap();
        assert_eq!(w.policy, RerunPolicy::PreserveFirstFailure);
    }
}
