//! Method matching.
//!
//! Cross-cutting operations ([`invalidate_cache`](crate::engine::invalidate_cache),
//! [`update_state`](crate::engine::update_state),
//! [`set_cache_data`](crate::engine::set_cache_data)) address descriptors the
//! caller never held a reference to. A [`MethodSelector`] resolves against
//! the universe of named descriptors registered by all live engines, in
//! creation order; an unmatched selector yields an empty result, never an
//! error.
//!
//! # Example
//!
//! ```rust,ignore
//! // Every descriptor named "userList", across engines:
//! let methods = select(&"userList".into());
//!
//! // Regex over names, scoped to one engine:
//! let selector = MethodFilter::pattern(Regex::new("^user")?)
//!     .scope("main")
//!     .into();
//! ```

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::engine;
use crate::method::Method;

/// Predicate over `(descriptor, index, candidate list)` applied after the
/// name pre-filter.
pub type MethodPredicate = Arc<dyn Fn(&Method, usize, &[Method]) -> bool + Send + Sync>;

/// Name pre-filter of a [`MethodFilter`].
#[derive(Clone)]
pub enum NameMatcher {
    /// Exact name equality.
    Exact(String),
    /// Regex over the name.
    Pattern(Regex),
}

impl NameMatcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(expected) => name == expected,
            Self::Pattern(pattern) => pattern.is_match(name),
        }
    }
}

impl fmt::Debug for NameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => write!(f, "Exact({name:?})"),
            Self::Pattern(pattern) => write!(f, "Pattern({:?})", pattern.as_str()),
        }
    }
}

/// Structured selector: name pre-filter, optional predicate, optional engine
/// scope.
#[derive(Clone)]
pub struct MethodFilter {
    name: NameMatcher,
    predicate: Option<MethodPredicate>,
    scope: Option<String>,
}

impl MethodFilter {
    /// Filter by exact name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: NameMatcher::Exact(name.into()),
            predicate: None,
            scope: None,
        }
    }

    /// Filter by name pattern.
    #[must_use]
    pub fn pattern(pattern: Regex) -> Self {
        Self {
            name: NameMatcher::Pattern(pattern),
            predicate: None,
            scope: None,
        }
    }

    /// Adds a predicate over the name-filtered candidates.
    #[must_use]
    pub fn predicate(
        mut self,
        predicate: impl Fn(&Method, usize, &[Method]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Restricts matching to descriptors created by the named engine.
    #[must_use]
    pub fn scope(mut self, engine_id: impl Into<String>) -> Self {
        self.scope = Some(engine_id.into());
        self
    }
}

/// A loose reference to one or more method descriptors.
#[derive(Clone)]
pub enum MethodSelector {
    /// A concrete descriptor: exact, singleton result.
    Instance(Method),
    /// Exact name equality across all live engines.
    Name(String),
    /// Regex over names across all live engines.
    Pattern(Regex),
    /// Name pre-filter plus predicate, optionally engine-scoped.
    Filter(MethodFilter),
}

impl From<Method> for MethodSelector {
    fn from(method: Method) -> Self {
        Self::Instance(method)
    }
}

impl From<&Method> for MethodSelector {
    fn from(method: &Method) -> Self {
        Self::Instance(method.clone())
    }
}

impl From<&str> for MethodSelector {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for MethodSelector {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Regex> for MethodSelector {
    fn from(pattern: Regex) -> Self {
        Self::Pattern(pattern)
    }
}

impl From<MethodFilter> for MethodSelector {
    fn from(filter: MethodFilter) -> Self {
        Self::Filter(filter)
    }
}

/// Resolves a selector against every live engine's registered descriptors.
///
/// Results preserve creation order (engines in registration order, then
/// descriptors in creation order). Descriptors without a name are only
/// reachable through [`MethodSelector::Instance`].
pub(crate) fn select(selector: &MethodSelector) -> Vec<Method> {
    match selector {
        MethodSelector::Instance(method) => vec![method.clone()],
        MethodSelector::Name(name) => by_name(&NameMatcher::Exact(name.clone()), None),
        MethodSelector::Pattern(pattern) => {
            by_name(&NameMatcher::Pattern(pattern.clone()), None)
        }
        MethodSelector::Filter(filter) => {
            let candidates = by_name(&filter.name, filter.scope.as_deref());
            match &filter.predicate {
                None => candidates,
                Some(predicate) => candidates
                    .iter()
                    .enumerate()
                    .filter(|(index, method)| predicate(method, *index, &candidates))
                    .map(|(_, method)| method.clone())
                    .collect(),
            }
        }
    }
}

fn by_name(matcher: &NameMatcher, scope: Option<&str>) -> Vec<Method> {
    engine::registered_methods(scope)
        .into_iter()
        .filter(|method| method.name().is_some_and(|name| matcher.matches(name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matcher_exact() {
        let matcher = NameMatcher::Exact("userList".to_string());
        assert!(matcher.matches("userList"));
        assert!(!matcher.matches("userList2"));
        assert!(!matcher.matches("user"));
    }

    #[test]
    fn test_name_matcher_pattern() {
        let matcher = NameMatcher::Pattern(Regex::new("^user").expect("regex"));
        assert!(matcher.matches("userList"));
        assert!(matcher.matches("user1"));
        assert!(!matcher.matches("list-of-users"));
    }

    #[test]
    fn test_selector_conversions() {
        assert!(matches!("a".into(), MethodSelector::Name(_)));
        assert!(matches!(
            Regex::new("a").expect("regex").into(),
            MethodSelector::Pattern(_)
        ));
        assert!(matches!(
            MethodFilter::named("a").into(),
            MethodSelector::Filter(_)
        ));
    }
}
