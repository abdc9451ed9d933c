use thiserror::Error;

/// Failures from resolving a selector against a [`crate::RouteDirectory`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteDirectoryError {
    #[error("no route matches selector {selector:?}")]
    NoMatch { selector: String },

    #[error("selector {selector:?} matches more than one route: {candidates:?}")]
    Ambiguous {
        selector: String,
        candidates: Vec<String>,
    },
}
