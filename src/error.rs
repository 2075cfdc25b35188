//! Error types for kbb8

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for bootstrap operations
///
/// Every failure is attributed to one category so the caller can decide
/// whether it is fatal to the whole run. None of them are retried internally.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or unsupported input (unsupported apiVersion, missing executable, bad config)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A local resource could not be allocated (free port, working directory)
    #[error("resource allocation error: {0}")]
    ResourceAllocation(String),

    /// A readiness wait was cancelled or timed out before success
    #[error("readiness timeout: {0}")]
    ReadinessTimeout(String),

    /// Applying a managed object failed or the object vanished while waiting
    #[error("reconciliation error: {0}")]
    Reconciliation(String),

    /// Spawning, signalling or reaping a supervised process failed
    #[error("process lifecycle error: {0}")]
    ProcessLifecycle(String),

    /// Credentials file could not be read, merged or written
    #[error("credentials error: {0}")]
    Credentials(String),

    /// One or more providers failed to start; `source` is the first failure
    #[error("provider(s) {} failed: {source}", .names.join(", "))]
    ProviderFailed {
        /// Names of every failed provider
        names: Vec<String>,
        /// Error of the first failed provider
        #[source]
        source: Box<Error>,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Certificate generation error
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a resource allocation error with the given message
    pub fn resource_allocation(msg: impl Into<String>) -> Self {
        Self::ResourceAllocation(msg.into())
    }

    /// Create a readiness timeout error with the given message
    pub fn readiness_timeout(msg: impl Into<String>) -> Self {
        Self::ReadinessTimeout(msg.into())
    }

    /// Create a reconciliation error with the given message
    pub fn reconciliation(msg: impl Into<String>) -> Self {
        Self::Reconciliation(msg.into())
    }

    /// Create a process lifecycle error with the given message
    pub fn process_lifecycle(msg: impl Into<String>) -> Self {
        Self::ProcessLifecycle(msg.into())
    }

    /// Create a credentials error with the given message
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for errors caused by invalid input rather than the environment
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
