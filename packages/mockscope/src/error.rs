//! Error types for scope resolution.

use std::path::PathBuf;

use thiserror::Error;

/// Structural errors raised while assembling resolvers and registries.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("a scope registry needs exactly one leaf level, found {found}")]
    LeafCount { found: usize },

    #[error("no framework adapter is available in this process")]
    NoAdapterAvailable,

    #[error("framework adapter '{name}' is registered twice")]
    DuplicateAdapter { name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown store strategy '{value}' (expected 'strong' or 'weak')")]
    UnknownStore { value: String },
}

/// Wrapper a resource constructor uses when the parent resource's own static
/// setup failed. The resolver strips it and hands the inner error to the
/// caller unchanged.
#[derive(Debug, Error)]
#[error("resource initialization failed: {inner}")]
pub struct InitializationError {
    pub inner: anyhow::Error,
}

impl InitializationError {
    pub fn new(inner: impl Into<anyhow::Error>) -> Self {
        InitializationError {
            inner: inner.into(),
        }
    }
}

/// Strip an [`InitializationError`] wrapper, returning the original failure.
pub fn unwrap_initialization(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<InitializationError>() {
        Ok(wrapper) => wrapper.inner,
        Err(other) => other,
    }
}

/// Wrapped cause of an assertion failure, visible through `source()`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Default assertion failure raised when no framework adapter supplies its
/// own exception factory.
#[derive(Debug, Error)]
#[error("assertion failed: {message}")]
pub struct AssertionFailed {
    pub message: String,
    #[source]
    pub inner: Option<BoxError>,
}

/// Assertion failure translated for a host test framework.
#[derive(Debug, Error)]
#[error("{type_name}: {message}")]
pub struct HostAssertionError {
    pub framework: String,
    pub type_name: String,
    pub message: String,
    #[source]
    pub inner: Option<BoxError>,
}
