//! kube-apiserver process and its PKI

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::net::{suggest_endpoint, ServiceEndpoint};
use crate::pki::{write_pem_file, CertificateAuthority, CERT_FILE_MODE, KEY_FILE_MODE};
use crate::process::{open_log_file, HealthCheck, ProcessHandle, ProcessSpec};
use crate::{Error, Result, LOCAL_HOST};

/// Readiness path served by the API server
pub const HEALTH_PATH: &str = "/readyz";

/// Service IP range handed to the API server
pub const SERVICE_CLUSTER_IP_RANGE: &str = "10.0.0.0/24";

/// Issuer written into service account tokens
pub const SERVICE_ACCOUNT_ISSUER: &str = "https://kubernetes.default.svc.cluster.local";

/// In-cluster names the serving certificate is valid for
const IN_CLUSTER_NAMES: &[&str] = &[
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
];

/// Key material written for one API server run
#[derive(Debug)]
pub struct ApiServerPki {
    /// CA for serving and client certificates
    pub ca: CertificateAuthority,
    /// `ca.crt`
    pub ca_file: PathBuf,
    /// `tls.crt`
    pub cert_file: PathBuf,
    /// `tls.key`
    pub key_file: PathBuf,
    /// `sa-signer.crt`, the service account verification key
    pub sa_cert_file: PathBuf,
    /// `sa-signer.key`, the service account signing key
    pub sa_key_file: PathBuf,
}

impl ApiServerPki {
    /// Generate fresh CAs and write them under `dir`
    pub fn generate(dir: &Path, host: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::resource_allocation(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let ca = CertificateAuthority::new("kbb8 kubernetes CA")?;
        let mut names = vec![host, "localhost"];
        names.extend_from_slice(IN_CLUSTER_NAMES);
        let serving = ca.generate_serving_cert(&names)?;

        let ca_file = dir.join("ca.crt");
        write_pem_file(&ca_file, ca.ca_cert_pem(), CERT_FILE_MODE)?;
        let (cert_file, key_file) = serving.write_pair(dir)?;

        let sa_signer = CertificateAuthority::new("kbb8 service account signer")?;
        let sa_cert_file = dir.join("sa-signer.crt");
        let sa_key_file = dir.join("sa-signer.key");
        write_pem_file(&sa_cert_file, sa_signer.ca_cert_pem(), CERT_FILE_MODE)?;
        write_pem_file(&sa_key_file, sa_signer.ca_key_pem(), KEY_FILE_MODE)?;

        Ok(Self {
            ca,
            ca_file,
            cert_file,
            key_file,
            sa_cert_file,
            sa_key_file,
        })
    }
}

/// Local kube-apiserver backed by one etcd member
#[derive(Debug)]
pub struct ApiServer {
    path: PathBuf,
    dir: PathBuf,
    endpoint: Option<ServiceEndpoint>,
    pki: Option<ApiServerPki>,
    process: Option<ProcessHandle>,
}

impl ApiServer {
    /// `path` is the kube-apiserver binary; state lives under `work_dir/kubernetes/api-server`
    pub fn new(path: PathBuf, work_dir: &Path) -> Self {
        Self {
            path,
            dir: work_dir.join("kubernetes").join("api-server"),
            endpoint: None,
            pki: None,
            process: None,
        }
    }

    /// Secure endpoint, once started
    pub fn endpoint(&self) -> Option<&ServiceEndpoint> {
        self.endpoint.as_ref()
    }

    /// CA the serving and admin certificates chain to, once started
    pub fn ca(&self) -> Option<&CertificateAuthority> {
        self.pki.as_ref().map(|pki| &pki.ca)
    }

    /// Command line for an API server on `endpoint` using `etcd`
    pub fn args(endpoint: &ServiceEndpoint, pki: &ApiServerPki, etcd: &ServiceEndpoint) -> Vec<String> {
        vec![
            format!("--advertise-address={}", endpoint.host),
            format!("--secure-port={}", endpoint.port),
            format!("--client-ca-file={}", pki.ca_file.display()),
            format!("--tls-cert-file={}", pki.cert_file.display()),
            format!("--tls-private-key-file={}", pki.key_file.display()),
            format!("--service-cluster-ip-range={}", SERVICE_CLUSTER_IP_RANGE),
            "--authorization-mode=RBAC".to_string(),
            format!("--service-account-key-file={}", pki.sa_cert_file.display()),
            format!(
                "--service-account-signing-key-file={}",
                pki.sa_key_file.display()
            ),
            format!("--service-account-issuer={}", SERVICE_ACCOUNT_ISSUER),
            format!("--etcd-servers={}", etcd.url()),
        ]
    }

    /// Allocate a port, generate PKI and spawn the API server
    pub fn start(&mut self, etcd: &ServiceEndpoint) -> Result<()> {
        let log = open_log_file(&self.dir, "api-server.log")?;
        let endpoint = suggest_endpoint("https", LOCAL_HOST)?;
        let pki = ApiServerPki::generate(&self.dir.join("ca"), &endpoint.host)?;

        let mut process = ProcessHandle::init(ProcessSpec {
            path: self.path.clone(),
            args: Self::args(&endpoint, &pki, etcd),
            health: HealthCheck {
                url: endpoint.url(),
                path: HEALTH_PATH.to_string(),
                ca_pem: Some(pki.ca.ca_cert_pem().to_string()),
            },
        })?;
        self.pki = Some(pki);
        process.start(log.try_clone()?, log)?;

        info!(url = %endpoint, "kube-apiserver started");
        self.endpoint = Some(endpoint);
        self.process = Some(process);
        Ok(())
    }

    /// Block until `/readyz` answers over TLS
    pub async fn wait_ready(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::process_lifecycle("kube-apiserver was never started"))?;
        process.wait_ready(cancel, timeout).await
    }

    /// Stop the API server
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.stop(grace).await?;
        }
        Ok(())
    }
}
