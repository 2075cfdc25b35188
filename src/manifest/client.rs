//! API server access for managed objects

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;

use super::{ManagedKind, ManagedObject};
use crate::Result;

/// Minimal CRUD surface the reconciler needs
///
/// This trait abstracts the API server for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, kind: ManagedKind, name: &str) -> Result<Option<ManagedObject>>;

    /// Create an object that does not exist yet
    async fn create(&self, object: &ManagedObject) -> Result<()>;

    /// Replace an existing object; the resourceVersion must be set
    async fn replace(&self, object: &ManagedObject) -> Result<()>;
}

/// [`ObjectClient`] backed by a kube client
#[derive(Clone)]
pub struct KubeObjectClient {
    client: Client,
}

impl KubeObjectClient {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(&self, kind: ManagedKind, name: &str) -> Result<Option<ManagedObject>> {
        Ok(match kind {
            ManagedKind::CustomResourceDefinition => {
                get_opt(self.api::<CustomResourceDefinition>(), name)
                    .await?
                    .map(ManagedObject::Crd)
            }
            ManagedKind::MutatingWebhookConfiguration => {
                get_opt(self.api::<MutatingWebhookConfiguration>(), name)
                    .await?
                    .map(ManagedObject::Mutating)
            }
            ManagedKind::ValidatingWebhookConfiguration => {
                get_opt(self.api::<ValidatingWebhookConfiguration>(), name)
                    .await?
                    .map(ManagedObject::Validating)
            }
        })
    }

    async fn create(&self, object: &ManagedObject) -> Result<()> {
        let pp = PostParams::default();
        match object {
            ManagedObject::Crd(crd) => {
                self.api::<CustomResourceDefinition>().create(&pp, crd).await?;
            }
            ManagedObject::Mutating(hook) => {
                self.api::<MutatingWebhookConfiguration>()
                    .create(&pp, hook)
                    .await?;
            }
            ManagedObject::Validating(hook) => {
                self.api::<ValidatingWebhookConfiguration>()
                    .create(&pp, hook)
                    .await?;
            }
        }
        Ok(())
    }

    async fn replace(&self, object: &ManagedObject) -> Result<()> {
        let pp = PostParams::default();
        let name = object.name();
        match object {
            ManagedObject::Crd(crd) => {
                self.api::<CustomResourceDefinition>()
                    .replace(name, &pp, crd)
                    .await?;
            }
            ManagedObject::Mutating(hook) => {
                self.api::<MutatingWebhookConfiguration>()
                    .replace(name, &pp, hook)
                    .await?;
            }
            ManagedObject::Validating(hook) => {
                self.api::<ValidatingWebhookConfiguration>()
                    .replace(name, &pp, hook)
                    .await?;
            }
        }
        Ok(())
    }
}
