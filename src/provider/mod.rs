//! Cluster API provider managers
//!
//! A provider package is a directory holding a `manager` binary and its
//! `components.yaml` manifest. Starting a provider is strictly sequential:
//!
//! 1. Allocate a webhook port and a health port
//! 2. Generate a fresh CA and a serving certificate for the webhook server
//! 3. Reconcile the CRDs and webhook configurations from the manifest,
//!    pointed at the local webhook endpoint
//! 4. Spawn the manager and wait for `/healthz`
//!
//! Providers never share ports, CAs or files, so any number of them can start
//! concurrently; see [`orchestrator`].

pub mod orchestrator;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::manifest::{KubeObjectClient, ReconcileSummary, Reconciler, WebhookTarget};
use crate::net::{suggest_endpoint, ServiceEndpoint};
use crate::pki::CertificateAuthority;
use crate::process::{open_log_file, HealthCheck, ProcessHandle, ProcessSpec, DEFAULT_STOP_GRACE};
use crate::{Error, Result, LOCAL_HOST};

pub use orchestrator::{OrchestrationReport, Orchestrator, ProviderFailure, ProviderUnit};

/// Manager binary inside a provider package
pub const BINARY_NAME: &str = "manager";

/// Manifest inside a provider package
pub const MANIFEST_NAME: &str = "components.yaml";

/// Readiness path served by provider managers
pub const HEALTH_PATH: &str = "/healthz";

/// Prefix stripped from package directory names
const PACKAGE_PREFIX: &str = "bootstrap-";

/// A provider package and the extra arguments for its manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Directory holding `manager` and `components.yaml`
    pub package_path: PathBuf,
    /// Extra manager arguments, passed before the generated ones
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProviderSpec {
    /// Create a spec from a package path and extra args
    pub fn new(package_path: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            package_path: package_path.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Display name: package base name without `bootstrap-`, upper-cased
    ///
    /// `./packages/bootstrap-capd` is named `CAPD`.
    pub fn name(&self) -> String {
        let base = self
            .package_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        base.strip_prefix(PACKAGE_PREFIX)
            .unwrap_or(&base)
            .to_uppercase()
    }
}

/// Environment shared by every provider of a run
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// Kubeconfig holding the control plane credentials
    pub kubeconfig: PathBuf,
    /// Context to use; the file's current context otherwise
    pub context: Option<String>,
    /// Working directory root
    pub work_dir: PathBuf,
    /// Upper bound for the manager readiness wait
    pub process_ready_timeout: Option<Duration>,
    /// Upper bound for each object readiness wait
    pub object_ready_timeout: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl ProviderSettings {
    /// Settings with default timeouts
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            context: None,
            work_dir: PathBuf::from(crate::DEFAULT_WORK_DIR),
            process_ready_timeout: None,
            object_ready_timeout: Some(crate::manifest::DEFAULT_OBJECT_READY_TIMEOUT),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Ports allocated to one provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// HTTPS webhook server
    pub webhook: ServiceEndpoint,
    /// HTTP health server
    pub health: ServiceEndpoint,
}

/// One provider manager and everything it owns
#[derive(Debug)]
pub struct Provider {
    spec: ProviderSpec,
    name: String,
    settings: ProviderSettings,
    endpoints: Option<ProviderEndpoints>,
    summary: Option<ReconcileSummary>,
    process: Option<ProcessHandle>,
}

impl Provider {
    /// Prepare a provider; nothing runs until [`Provider::start`]
    pub fn new(spec: ProviderSpec, settings: ProviderSettings) -> Self {
        let name = spec.name();
        Self {
            spec,
            name,
            settings,
            endpoints: None,
            summary: None,
            process: None,
        }
    }

    /// Derived display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocated ports, once started
    pub fn endpoints(&self) -> Option<&ProviderEndpoints> {
        self.endpoints.as_ref()
    }

    /// Objects applied from the manifest, once reconciled
    pub fn summary(&self) -> Option<ReconcileSummary> {
        self.summary
    }

    /// Whether the manager answered its last health poll
    pub fn ready(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.ready())
    }

    /// `<work>/provider/<lower-case name>`
    pub fn dir(&self) -> PathBuf {
        self.settings
            .work_dir
            .join("provider")
            .join(self.name.to_lowercase())
    }

    /// Manager command line: extra args first, then the generated flags
    pub fn args(
        extra: &[String],
        kubeconfig: &Path,
        cert_dir: &Path,
        endpoints: &ProviderEndpoints,
    ) -> Vec<String> {
        let mut args = extra.to_vec();
        args.extend([
            format!("--kubeconfig={}", kubeconfig.display()),
            format!("--webhook-cert-dir={}", cert_dir.display()),
            format!("--webhook-port={}", endpoints.webhook.port),
            format!("--health-addr={}", endpoints.health.host_port()),
            "--metrics-bind-addr=0".to_string(),
        ]);
        args
    }

    /// Run the full start sequence and wait for the manager to be healthy
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::process_lifecycle(format!(
                "provider {} is already started",
                self.name
            )));
        }
        let dir = self.dir();
        let log = open_log_file(&dir, "manager.log")?;

        let endpoints = ProviderEndpoints {
            webhook: suggest_endpoint("https", LOCAL_HOST).map_err(|e| {
                Error::resource_allocation(format!(
                    "unable to grab a free port for {} webhooks: {}",
                    self.name, e
                ))
            })?,
            health: suggest_endpoint("http", LOCAL_HOST).map_err(|e| {
                Error::resource_allocation(format!(
                    "unable to grab a free port for {} health: {}",
                    self.name, e
                ))
            })?,
        };
        self.endpoints = Some(endpoints.clone());

        let ca = CertificateAuthority::new(&format!("kbb8 {} webhook CA", self.name))?;
        let serving = ca.generate_serving_cert(&["localhost", &endpoints.webhook.host])?;
        let cert_dir = dir.join("ca");
        serving.write_pair(&cert_dir).map_err(|e| {
            Error::resource_allocation(format!(
                "unable to write {} webhook certs: {}",
                self.name, e
            ))
        })?;

        let client = kube_client(&self.settings.kubeconfig, self.settings.context.as_deref()).await?;
        let target = WebhookTarget {
            endpoint: endpoints.webhook.clone(),
            ca_bundle: ca.ca_cert_pem().as_bytes().to_vec(),
        };
        let summary = Reconciler::new(KubeObjectClient::new(client))
            .with_ready_timeout(self.settings.object_ready_timeout)
            .reconcile(&self.spec.package_path.join(MANIFEST_NAME), &target, cancel)
            .await?;
        self.summary = Some(summary);

        let mut process = ProcessHandle::init(ProcessSpec {
            path: self.spec.package_path.join(BINARY_NAME),
            args: Self::args(&self.spec.args, &self.settings.kubeconfig, &cert_dir, &endpoints),
            health: HealthCheck {
                url: endpoints.health.url(),
                path: HEALTH_PATH.to_string(),
                ca_pem: None,
            },
        })?;
        process.start(log.try_clone()?, log)?;
        let process = self.process.insert(process);
        process
            .wait_ready(cancel, self.settings.process_ready_timeout)
            .await?;

        info!(
            provider = %self.name,
            webhook = %endpoints.webhook,
            health = %endpoints.health,
            "provider ready"
        );
        Ok(())
    }

    /// Stop the manager; a no-op if it never started
    pub async fn stop(&mut self) -> Result<()> {
        match self.process.take() {
            Some(mut process) => process.stop(self.settings.stop_grace).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderUnit for Provider {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        Provider::start(self, cancel).await
    }

    async fn stop(&mut self) -> Result<()> {
        Provider::stop(self).await
    }
}

/// Build a client for `context` (or the current context) of a kubeconfig file
pub async fn kube_client(kubeconfig: &Path, context: Option<&str>) -> Result<Client> {
    let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::credentials(format!(
            "failed to read kubeconfig {}: {}",
            kubeconfig.display(),
            e
        ))
    })?;
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(raw, &options)
        .await
        .map_err(|e| Error::credentials(format!("failed to load kubeconfig: {}", e)))?;
    Ok(Client::try_from(config)?)
}
