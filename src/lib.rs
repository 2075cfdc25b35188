//! kbb8 - fast local bootstrap of a Cluster API management plane
//!
//! kbb8 starts an ephemeral etcd + kube-apiserver pair and a set of Cluster API
//! provider managers as plain, unprivileged local processes, wires them together
//! with throwaway TLS identities, and publishes the result as a kubeconfig context.
//!
//! # Architecture
//!
//! - The control plane is strictly sequential: etcd, then the API server, then
//!   the kubeconfig entry
//! - Providers start concurrently; each one gets its own CA, its own ports, and
//!   its own set of CRDs and webhook configurations to reconcile
//! - Teardown runs in reverse and tolerates partially started state
//!
//! # Modules
//!
//! - [`process`] - Supervisor for one external executable (spawn, health-gate, stop)
//! - [`pki`] - Throwaway certificate authorities
//! - [`net`] - Free local port allocation
//! - [`credentials`] - Kubeconfig merge/removal
//! - [`controlplane`] - etcd + kube-apiserver bootstrapper
//! - [`manifest`] - CRD and webhook configuration reconciler
//! - [`provider`] - Provider lifecycle and concurrent orchestration
//! - [`config`] - Run configuration and defaults
//! - [`poll`] - Cancellable polling helper
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controlplane;
pub mod credentials;
pub mod error;
pub mod manifest;
pub mod net;
pub mod pki;
pub mod poll;
pub mod process;
pub mod provider;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Prefix for every kubeconfig cluster, context and user written by kbb8
pub const CREDENTIALS_KEY_PREFIX: &str = "kbb8";

/// Interval between readiness polls (processes and objects)
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Host every supervised process listens on
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Default working directory root, relative to the current directory
pub const DEFAULT_WORK_DIR: &str = ".tmp";

/// Install the process-wide rustls crypto provider
///
/// kube and reqwest both build rustls configs from the process default, so
/// this must run before the first client is created. Repeated calls are
/// harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
