use serde::{Deserialize, Serialize};

use crate::error::RouteDirectoryError;

/// Whether a route is a fire-and-forget push subscription or a
/// caller-driven pull subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Push,
    Pull,
}

/// One entry of the route directory: a selector pattern (what callers ask
/// for) mapped to the NATS subject it resolves to, plus the delivery shape.
///
/// `name` and `queue` both present selects a durable, queue-grouped
/// JetStream consumer; either absent falls back to an ephemeral
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub selector: String,
    pub subject: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// JetStream `max_ack_pending` for durable consumers (spec.md §6).
    #[serde(default, rename = "max_ack_pending")]
    pub max_ack_pending: Option<i64>,
    /// Ack wait, in seconds (spec.md §6: "int seconds").
    #[serde(default, rename = "ack_wait")]
    pub ack_wait: Option<u64>,
    #[serde(default, rename = "batch_size")]
    pub batch_size: Option<usize>,
}

fn default_mode() -> Mode {
    Mode::Push
}

impl RouteConfig {
    /// True when this route should be backed by a durable JetStream stream
    /// rather than an ephemeral core-NATS subscription.
    pub fn is_durable(&self) -> bool {
        self.name.is_some() && self.queue.is_some()
    }
}

/// A loaded set of [`RouteConfig`] entries, resolved by selector lookup.
/// Selectors are `/`-delimited segment patterns; a segment of exactly `*`
/// matches any single segment. An exact (no-wildcard) match always wins
/// over a wildcard match; two equally-specific matches for the same
/// selector is an error rather than an arbitrary pick.
#[derive(Debug, Clone, Default)]
pub struct RouteDirectory {
    routes: Vec<RouteConfig>,
}

impl RouteDirectory {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    /// Resolves `selector` to its route, per the matching rules above.
    ///
    /// Per spec: an exact match always wins immediately. Otherwise, every
    /// configured selector ending in `/*` is a prefix match — strip the
    /// trailing two characters and test whether `selector` starts with what
    /// remains (a plain string prefix test, not a segment-count match, so a
    /// wildcard entry can match selectors nested arbitrarily deeper than
    /// itself). Zero matches is an error; exactly one wins; two or more is
    /// an ambiguity error that is never silently resolved.
    pub fn resolve(&self, selector: &str) -> Result<&RouteConfig, RouteDirectoryError> {
        if let Some(route) = self.routes.iter().find(|r| r.selector == selector) {
            return Ok(route);
        }

        let candidates: Vec<&RouteConfig> = self
            .routes
            .iter()
            .filter(|r| {
                r.selector
                    .strip_suffix("/*")
                    .is_some_and(|prefix| selector.starts_with(prefix))
            })
            .collect();

        match candidates.len() {
            0 => Err(RouteDirectoryError::NoMatch {
                selector: selector.to_string(),
            }),
            1 => Ok(candidates[0]),
            _ => Err(RouteDirectoryError::Ambiguous {
                selector: selector.to_string(),
                candidates: candidates.iter().map(|r| r.selector.clone()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(selector: &str, subject: &str) -> RouteConfig {
        RouteConfig {
            selector: selector.to_string(),
            subject: subject.to_string(),
            url: "nats://localhost:4222".to_string(),
            mode: Mode::Push,
            queue: None,
            name: None,
            max_ack_pending: None,
            ack_wait: None,
            batch_size: None,
        }
    }

    #[test]
    fn exact_match_resolves() {
        let dir = RouteDirectory::new(vec![route("orders/created", "orders.created")]);
        let r = dir.resolve("orders/created").unwrap();
        assert_eq!(r.subject, "orders.created");
    }

    #[test]
    fn wildcard_matches_single_segment() {
        let dir = RouteDirectory::new(vec![route("orders/*", "orders.any")]);
        let r = dir.resolve("orders/created").unwrap();
        assert_eq!(r.subject, "orders.any");
    }

    #[test]
    fn wildcard_is_a_string_prefix_test_not_a_segment_count_match() {
        // Per spec.md S5/4.6: the trailing "/*" is stripped and the
        // selector only needs to start with what remains -- it is not
        // restricted to matching exactly one more path segment.
        let dir = RouteDirectory::new(vec![route("orders/*", "orders.any")]);
        let r = dir.resolve("orders/created/now").unwrap();
        assert_eq!(r.subject, "orders.any");
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let dir = RouteDirectory::new(vec![
            route("orders/*", "orders.any"),
            route("orders/created", "orders.created"),
        ]);
        let r = dir.resolve("orders/created").unwrap();
        assert_eq!(r.subject, "orders.created");
    }

    #[test]
    fn s5_wildcard_selectors_resolve_by_prefix() {
        let dir = RouteDirectory::new(vec![
            route("language/models/openai/*", "models.openai"),
            route("language/models/llama/*", "models.llama"),
        ]);
        assert_eq!(
            dir.resolve("language/models/openai/gpt-4").unwrap().subject,
            "models.openai"
        );
        assert!(matches!(
            dir.resolve("language/models/cohere/x").unwrap_err(),
            RouteDirectoryError::NoMatch { .. }
        ));
    }

    #[test]
    fn s5_adding_a_broader_wildcard_creates_ambiguity() {
        let dir = RouteDirectory::new(vec![
            route("language/models/openai/*", "models.openai"),
            route("language/models/llama/*", "models.llama"),
            route("language/models/*", "models.any"),
        ]);
        let err = dir.resolve("language/models/openai/gpt-4").unwrap_err();
        assert!(matches!(err, RouteDirectoryError::Ambiguous { .. }));
    }

    #[test]
    fn no_match_is_an_error() {
        let dir = RouteDirectory::new(vec![route("orders/created", "orders.created")]);
        let err = dir.resolve("shipments/created").unwrap_err();
        assert!(matches!(err, RouteDirectoryError::NoMatch { .. }));
    }

    #[test]
    fn durable_requires_both_name_and_queue() {
        let mut r = route("orders/created", "orders.created");
        assert!(!r.is_durable());
        r.queue = Some("workers".to_string());
        assert!(!r.is_durable());
        r.name = Some("orders-stream".to_string());
        assert!(r.is_durable());
    }
}
