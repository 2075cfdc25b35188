//! CRD and webhook configuration reconciler
//!
//! Provider manifests are written for an in-cluster deployment: webhooks
//! point at a Service and are trusted through cert-manager injection. None of
//! that exists in a kbb8 run, so before anything reaches the API server every
//! webhook client config is rewritten to the provider's local HTTPS endpoint
//! and its freshly generated CA.
//!
//! Only three kinds are managed; everything else in the manifest is skipped:
//!
//! - `CustomResourceDefinition` (`apiextensions.k8s.io/v1`)
//! - `MutatingWebhookConfiguration` (`admissionregistration.k8s.io/v1`)
//! - `ValidatingWebhookConfiguration` (`admissionregistration.k8s.io/v1`)

mod client;

pub use client::{KubeObjectClient, ObjectClient};
#[cfg(test)]
pub use client::MockObjectClient;

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
    WebhookClientConfig as AdmissionClientConfig,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, WebhookClientConfig as ConversionClientConfig,
    WebhookConversion,
};
use k8s_openapi::ByteString;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::net::ServiceEndpoint;
use crate::poll::wait_until;
use crate::{Error, Result, POLL_INTERVAL};

/// apiVersion accepted for CustomResourceDefinitions
pub const CRD_API_VERSION: &str = "apiextensions.k8s.io/v1";

/// apiVersion accepted for webhook configurations
pub const WEBHOOK_API_VERSION: &str = "admissionregistration.k8s.io/v1";

/// Conversion review versions offered by injected conversion webhooks
pub const CONVERSION_REVIEW_VERSIONS: &[&str] = &["v1", "v1beta1"];

/// Path conversion webhooks are served on
pub const CONVERSION_PATH: &str = "convert";

/// Default bound for each object readiness wait
pub const DEFAULT_OBJECT_READY_TIMEOUT: Duration = Duration::from_secs(60);

const WEBHOOK_STRATEGY: &str = "Webhook";

// =============================================================================
// Managed objects
// =============================================================================

/// Kinds the reconciler manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    /// apiextensions.k8s.io/v1 CustomResourceDefinition
    CustomResourceDefinition,
    /// admissionregistration.k8s.io/v1 MutatingWebhookConfiguration
    MutatingWebhookConfiguration,
    /// admissionregistration.k8s.io/v1 ValidatingWebhookConfiguration
    ValidatingWebhookConfiguration,
}

impl ManagedKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomResourceDefinition => "CustomResourceDefinition",
            Self::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
            Self::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
        }
    }

    fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "CustomResourceDefinition" => Some(Self::CustomResourceDefinition),
            "MutatingWebhookConfiguration" => Some(Self::MutatingWebhookConfiguration),
            "ValidatingWebhookConfiguration" => Some(Self::ValidatingWebhookConfiguration),
            _ => None,
        }
    }

    fn api_version(&self) -> &'static str {
        match self {
            Self::CustomResourceDefinition => CRD_API_VERSION,
            _ => WEBHOOK_API_VERSION,
        }
    }
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object the reconciler creates or updates
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    /// CustomResourceDefinition
    Crd(CustomResourceDefinition),
    /// MutatingWebhookConfiguration
    Mutating(MutatingWebhookConfiguration),
    /// ValidatingWebhookConfiguration
    Validating(ValidatingWebhookConfiguration),
}

impl ManagedObject {
    /// Kind of this object
    pub fn kind(&self) -> ManagedKind {
        match self {
            Self::Crd(_) => ManagedKind::CustomResourceDefinition,
            Self::Mutating(_) => ManagedKind::MutatingWebhookConfiguration,
            Self::Validating(_) => ManagedKind::ValidatingWebhookConfiguration,
        }
    }

    fn metadata(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            Self::Crd(o) => &o.metadata,
            Self::Mutating(o) => &o.metadata,
            Self::Validating(o) => &o.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            Self::Crd(o) => &mut o.metadata,
            Self::Mutating(o) => &mut o.metadata,
            Self::Validating(o) => &mut o.metadata,
        }
    }

    /// metadata.name, empty when unset
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// metadata.resourceVersion
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    /// Overwrite metadata.resourceVersion
    pub fn set_resource_version(&mut self, version: Option<String>) {
        self.metadata_mut().resource_version = version;
    }

    /// Readiness predicate: CRDs need `Established=True`, webhook
    /// configurations are ready as soon as they exist
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Crd(crd) => crd
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Established" && c.status == "True")
                })
                .unwrap_or(false),
            Self::Mutating(_) | Self::Validating(_) => true,
        }
    }
}

// =============================================================================
// Manifest parsing and adaptation
// =============================================================================

/// Where a provider serves its webhooks and the CA that signed its certificate
#[derive(Clone, Debug)]
pub struct WebhookTarget {
    /// `https://<host>:<webhook port>`
    pub endpoint: ServiceEndpoint,
    /// PEM CA bundle the API server should trust
    pub ca_bundle: Vec<u8>,
}

impl WebhookTarget {
    /// `https://<host>:<port>/<path>` with any leading slash of `path` dropped
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.endpoint.url()
        } else {
            format!("{}/{}", self.endpoint.url(), path)
        }
    }
}

/// Managed objects of one manifest, grouped by kind in manifest order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManifestObjects {
    /// CustomResourceDefinitions
    pub crds: Vec<CustomResourceDefinition>,
    /// MutatingWebhookConfigurations
    pub mutating: Vec<MutatingWebhookConfiguration>,
    /// ValidatingWebhookConfigurations
    pub validating: Vec<ValidatingWebhookConfiguration>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeMeta {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: Option<NameOnly>,
}

#[derive(Deserialize)]
struct NameOnly {
    #[serde(default)]
    name: Option<String>,
}

impl ManifestObjects {
    /// Split a multi-document YAML string and keep the managed kinds
    ///
    /// An unsupported apiVersion of a managed kind is a configuration error.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut objects = Self::default();

        for document in serde_yaml::Deserializer::from_str(contents) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }

            let meta: TypeMeta = serde_yaml::from_value(value.clone())?;
            let Some(kind) = ManagedKind::from_kind(&meta.kind) else {
                continue;
            };
            if meta.api_version != kind.api_version() {
                let name = meta.metadata.and_then(|m| m.name).unwrap_or_default();
                return Err(Error::configuration(format!(
                    "only {} is supported for {} (name: {}, apiVersion: {})",
                    kind.api_version(),
                    kind,
                    name,
                    meta.api_version
                )));
            }

            match kind {
                ManagedKind::CustomResourceDefinition => {
                    objects.crds.push(serde_yaml::from_value(value)?)
                }
                ManagedKind::MutatingWebhookConfiguration => {
                    objects.mutating.push(serde_yaml::from_value(value)?)
                }
                ManagedKind::ValidatingWebhookConfiguration => {
                    objects.validating.push(serde_yaml::from_value(value)?)
                }
            }
        }

        Ok(objects)
    }

    /// Read and parse a manifest file
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("unable to read manifest {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    /// Point every webhook at `target`
    pub fn adapt(&mut self, target: &WebhookTarget) {
        for crd in &mut self.crds {
            adapt_crd(crd, target);
        }
        for config in &mut self.mutating {
            for webhook in config.webhooks.iter_mut().flatten() {
                adapt_client_config(&mut webhook.client_config, target);
            }
        }
        for config in &mut self.validating {
            for webhook in config.webhooks.iter_mut().flatten() {
                adapt_client_config(&mut webhook.client_config, target);
            }
        }
    }

    /// CRDs first, then mutating, then validating configurations
    pub fn into_ordered(self) -> Vec<ManagedObject> {
        self.crds
            .into_iter()
            .map(ManagedObject::Crd)
            .chain(self.mutating.into_iter().map(ManagedObject::Mutating))
            .chain(self.validating.into_iter().map(ManagedObject::Validating))
            .collect()
    }
}

fn adapt_crd(crd: &mut CustomResourceDefinition, target: &WebhookTarget) {
    let client_config = ConversionClientConfig {
        url: Some(target.url(CONVERSION_PATH)),
        ca_bundle: Some(ByteString(target.ca_bundle.clone())),
        service: None,
    };

    match &mut crd.spec.conversion {
        None => {
            crd.spec.conversion = Some(CustomResourceConversion {
                strategy: WEBHOOK_STRATEGY.to_string(),
                webhook: Some(WebhookConversion {
                    client_config: Some(client_config),
                    conversion_review_versions: CONVERSION_REVIEW_VERSIONS
                        .iter()
                        .map(|v| v.to_string())
                        .collect(),
                }),
            });
        }
        Some(conversion) if conversion.strategy == WEBHOOK_STRATEGY => {
            let webhook = conversion.webhook.get_or_insert_with(Default::default);
            webhook.client_config = Some(client_config);
            if webhook.conversion_review_versions.is_empty() {
                webhook.conversion_review_versions = CONVERSION_REVIEW_VERSIONS
                    .iter()
                    .map(|v| v.to_string())
                    .collect();
            }
        }
        // Explicit "None" strategy: the CRD opted out of conversion
        Some(_) => {}
    }
}

/// Path part of an absolute URL, without the leading slash
fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split_once('/').map(|(_, path)| path).unwrap_or("")
}

fn adapt_client_config(config: &mut AdmissionClientConfig, target: &WebhookTarget) {
    let path = config
        .service
        .as_ref()
        .and_then(|s| s.path.clone())
        .or_else(|| config.url.as_deref().map(|u| url_path(u).to_string()))
        .unwrap_or_default();

    *config = AdmissionClientConfig {
        url: Some(target.url(&path)),
        ca_bundle: Some(ByteString(target.ca_bundle.clone())),
        service: None,
    };
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Objects applied by one reconcile pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// CRDs applied
    pub crds: usize,
    /// Mutating webhook configurations applied
    pub mutating: usize,
    /// Validating webhook configurations applied
    pub validating: usize,
}

/// Applies managed objects and waits for them to become ready
pub struct Reconciler<C> {
    client: C,
    poll_interval: Duration,
    ready_timeout: Option<Duration>,
}

impl<C: ObjectClient> Reconciler<C> {
    /// Reconciler polling every 100ms with the default readiness bound
    pub fn new(client: C) -> Self {
        Self {
            client,
            poll_interval: POLL_INTERVAL,
            ready_timeout: Some(DEFAULT_OBJECT_READY_TIMEOUT),
        }
    }

    /// Override the readiness bound; `None` waits until cancelled
    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Read, adapt and apply the manifest at `path`
    ///
    /// Nothing is sent to the API server unless the whole manifest parses.
    pub async fn reconcile(
        &self,
        path: &Path,
        target: &WebhookTarget,
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary> {
        let mut objects = ManifestObjects::read(path)?;
        objects.adapt(target);

        let summary = ReconcileSummary {
            crds: objects.crds.len(),
            mutating: objects.mutating.len(),
            validating: objects.validating.len(),
        };

        for object in objects.into_ordered() {
            self.apply(object, cancel).await?;
        }

        info!(
            manifest = %path.display(),
            crds = summary.crds,
            mutating = summary.mutating,
            validating = summary.validating,
            "manifest reconciled"
        );
        Ok(summary)
    }

    /// Create or update one object, then wait until it is ready
    pub async fn apply(&self, mut object: ManagedObject, cancel: &CancellationToken) -> Result<()> {
        let kind = object.kind();
        let name = object.name().to_string();

        let existing = self.client.get(kind, &name).await.map_err(|e| {
            Error::reconciliation(format!("error fetching {} {}: {}", kind, name, e))
        })?;

        match existing {
            None => {
                self.client.create(&object).await.map_err(|e| {
                    Error::reconciliation(format!("error creating {} {}: {}", kind, name, e))
                })?;
                debug!(%kind, name = %name, "created");
            }
            Some(current) => {
                object.set_resource_version(current.resource_version().map(str::to_string));
                self.client.replace(&object).await.map_err(|e| {
                    Error::reconciliation(format!("error updating {} {}: {}", kind, name, e))
                })?;
                debug!(%kind, name = %name, "updated");
            }
        }

        self.wait_ready(kind, &name, cancel).await
    }

    async fn wait_ready(
        &self,
        kind: ManagedKind,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = &self.client;
        let description = format!("{} {} to become ready", kind, name);

        wait_until(
            cancel,
            self.poll_interval,
            self.ready_timeout,
            &description,
            || async move {
                match client.get(kind, name).await {
                    Ok(Some(current)) => Ok(current.is_ready()),
                    Ok(None) => Err(Error::reconciliation(format!(
                        "{} {} was deleted before becoming ready",
                        kind, name
                    ))),
                    Err(e) => Err(Error::reconciliation(format!(
                        "error fetching {} {}: {}",
                        kind, name, e
                    ))),
                }
            },
        )
        .await
    }
}
