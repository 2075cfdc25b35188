//! etcd + kube-apiserver bootstrapper
//!
//! Startup is a fixed linear sequence of stages:
//!
//! ```text
//! NotStarted -> StoreReady -> ApiServerReady -> CredentialsPublished
//! ```
//!
//! and teardown walks it back:
//!
//! ```text
//! CredentialsRemoved -> ApiServerStopped -> Stopped
//! ```
//!
//! `start` fails fast and leaves whatever it managed to start in place; the
//! caller must always call `stop`, which tolerates partially-initialized state.

mod apiserver;
mod etcd;

pub use apiserver::{ApiServer, ApiServerPki};
pub use etcd::Etcd;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::credentials::{self, CredentialsEntry, PublishedCredentials};
use crate::net::ServiceEndpoint;
use crate::process::DEFAULT_STOP_GRACE;
use crate::{Error, Result};

/// Where the control plane is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Nothing started yet
    NotStarted,
    /// etcd answers on `/health`
    StoreReady,
    /// kube-apiserver answers on `/readyz`
    ApiServerReady,
    /// Kubeconfig entry written; the control plane is usable
    CredentialsPublished,
    /// Kubeconfig entry removed
    CredentialsRemoved,
    /// kube-apiserver stopped
    ApiServerStopped,
    /// etcd stopped and its data removed
    Stopped,
}

/// Inputs for one control plane run
#[derive(Clone, Debug)]
pub struct ControlPlaneOptions {
    /// Directory holding the `etcd` and `kube-apiserver` binaries
    pub package_path: PathBuf,
    /// Working directory root for logs, PKI and data
    pub work_dir: PathBuf,
    /// Name used for the kubeconfig entry
    pub cluster_name: String,
    /// Kubeconfig override; default loading rules otherwise
    pub kubeconfig: Option<PathBuf>,
    /// Upper bound for each process readiness wait
    pub ready_timeout: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl ControlPlaneOptions {
    /// Options with default timeouts
    pub fn new(package_path: impl Into<PathBuf>, cluster_name: impl Into<String>) -> Self {
        Self {
            package_path: package_path.into(),
            work_dir: PathBuf::from(crate::DEFAULT_WORK_DIR),
            cluster_name: cluster_name.into(),
            kubeconfig: None,
            ready_timeout: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// The etcd + kube-apiserver pair and its published credentials
#[derive(Debug)]
pub struct ControlPlane {
    options: ControlPlaneOptions,
    stage: Stage,
    etcd: Option<Etcd>,
    api_server: Option<ApiServer>,
    credentials: Option<PublishedCredentials>,
}

impl ControlPlane {
    /// Prepare a control plane; nothing runs until [`ControlPlane::start`]
    pub fn new(options: ControlPlaneOptions) -> Self {
        Self {
            options,
            stage: Stage::NotStarted,
            etcd: None,
            api_server: None,
            credentials: None,
        }
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Kubeconfig file holding the published context
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.credentials.as_ref().map(|c| c.path.as_path())
    }

    /// Published context name
    pub fn context(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.context.as_str())
    }

    /// API server endpoint, once started
    pub fn api_server_endpoint(&self) -> Option<&ServiceEndpoint> {
        self.api_server.as_ref().and_then(|a| a.endpoint())
    }

    /// Start etcd, then the API server, then publish credentials
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.stage != Stage::NotStarted {
            return Err(Error::process_lifecycle(format!(
                "control plane cannot start from stage {:?}",
                self.stage
            )));
        }
        let work_dir = self.options.work_dir.clone();
        let timeout = self.options.ready_timeout;

        let etcd = self.etcd.insert(Etcd::new(
            self.options.package_path.join("etcd"),
            &work_dir,
        ));
        etcd.start()?;
        etcd.wait_ready(cancel, timeout).await?;
        let etcd_endpoint = etcd
            .endpoint()
            .cloned()
            .ok_or_else(|| Error::process_lifecycle("etcd has no endpoint"))?;
        self.stage = Stage::StoreReady;
        info!(url = %etcd_endpoint, "etcd ready");

        let api_server = self.api_server.insert(ApiServer::new(
            self.options.package_path.join("kube-apiserver"),
            &work_dir,
        ));
        api_server.start(&etcd_endpoint)?;
        api_server.wait_ready(cancel, timeout).await?;
        self.stage = Stage::ApiServerReady;

        let (endpoint, ca) = match (api_server.endpoint(), api_server.ca()) {
            (Some(endpoint), Some(ca)) => (endpoint, ca),
            _ => return Err(Error::process_lifecycle("kube-apiserver has no endpoint")),
        };
        info!(url = %endpoint, "kube-apiserver ready");

        let entry = CredentialsEntry::issue(ca, &self.options.cluster_name, &endpoint.url())?;
        let published = credentials::publish(&entry, self.options.kubeconfig.as_deref())?;
        self.credentials = Some(published);
        self.stage = Stage::CredentialsPublished;
        Ok(())
    }

    /// Remove credentials, stop the API server, stop etcd
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned.
    pub async fn stop(&mut self) -> Result<()> {
        let grace = self.options.stop_grace;
        let mut first_error = None;

        if self.credentials.take().is_some() {
            if let Err(e) = credentials::remove(
                &self.options.cluster_name,
                self.options.kubeconfig.as_deref(),
            ) {
                warn!(error = %e, "failed to remove credentials");
                first_error.get_or_insert(e);
            }
        }
        self.stage = Stage::CredentialsRemoved;

        if let Some(mut api_server) = self.api_server.take() {
            if let Err(e) = api_server.stop(grace).await {
                warn!(error = %e, "failed to stop kube-apiserver");
                first_error.get_or_insert(e);
            }
        }
        self.stage = Stage::ApiServerStopped;

        if let Some(mut etcd) = self.etcd.take() {
            if let Err(e) = etcd.stop(grace).await {
                warn!(error = %e, "failed to stop etcd");
                first_error.get_or_insert(e);
            }
        }
        self.stage = Stage::Stopped;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path) -> ControlPlaneOptions {
        let mut options = ControlPlaneOptions::new(dir.join("packages"), "bootstrap");
        options.work_dir = dir.join("work");
        options.kubeconfig = Some(dir.join("kubeconfig"));
        options.stop_grace = Duration::from_secs(1);
        options
    }

    #[tokio::test]
    async fn stop_without_start_reaches_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = ControlPlane::new(options(dir.path()));
        assert_eq!(cp.stage(), Stage::NotStarted);

        cp.stop().await.unwrap();
        assert_eq!(cp.stage(), Stage::Stopped);
        assert!(cp.context().is_none());
        cp.stop().await.unwrap();
    }

    /// Story: the package directory has no etcd binary
    ///
    /// Start fails on the first stage, and the follow-up stop still cleans
    /// up without touching the kubeconfig.
    #[tokio::test]
    async fn story_failed_start_is_torn_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = ControlPlane::new(options(dir.path()));

        let err = cp.start(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(cp.stage(), Stage::NotStarted);
        assert!(cp.api_server_endpoint().is_none());

        cp.stop().await.unwrap();
        assert_eq!(cp.stage(), Stage::Stopped);
        assert!(!dir.path().join("kubeconfig").exists());
        assert!(!dir.path().join("work/kubernetes/etcd/data").exists());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = ControlPlane::new(options(dir.path()));
        cp.stop().await.unwrap();
        let err = cp.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::ProcessLifecycle(_)));
    }
}
