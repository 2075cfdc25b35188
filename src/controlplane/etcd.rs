//! etcd process

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::{suggest_endpoint, ServiceEndpoint};
use crate::process::{open_log_file, HealthCheck, ProcessHandle, ProcessSpec};
use crate::{Error, Result, LOCAL_HOST};

/// Readiness path served by etcd
pub const HEALTH_PATH: &str = "/health";

/// Local etcd member listening on plain HTTP
#[derive(Debug)]
pub struct Etcd {
    path: PathBuf,
    dir: PathBuf,
    endpoint: Option<ServiceEndpoint>,
    process: Option<ProcessHandle>,
}

impl Etcd {
    /// `path` is the etcd binary; state lives under `work_dir/kubernetes/etcd`
    pub fn new(path: PathBuf, work_dir: &Path) -> Self {
        Self {
            path,
            dir: work_dir.join("kubernetes").join("etcd"),
            endpoint: None,
            process: None,
        }
    }

    /// Client URL, once started
    pub fn endpoint(&self) -> Option<&ServiceEndpoint> {
        self.endpoint.as_ref()
    }

    /// Data directory, removed on stop
    pub fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    /// Command line for an etcd member with the given URLs
    pub fn args(client: &ServiceEndpoint, peer: &ServiceEndpoint, data_dir: &Path) -> Vec<String> {
        vec![
            format!("--listen-client-urls={}", client.url()),
            format!("--advertise-client-urls={}", client.url()),
            format!("--listen-peer-urls={}", peer.url()),
            format!("--data-dir={}", data_dir.display()),
        ]
    }

    /// Allocate ports, prepare directories and spawn etcd
    pub fn start(&mut self) -> Result<()> {
        let data_dir = self.data_dir();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            Error::resource_allocation(format!("failed to create {}: {}", data_dir.display(), e))
        })?;
        let log = open_log_file(&self.dir, "etcd.log")?;

        let client = suggest_endpoint("http", LOCAL_HOST)?;
        let peer = suggest_endpoint("http", LOCAL_HOST)?;

        let mut process = ProcessHandle::init(ProcessSpec {
            path: self.path.clone(),
            args: Self::args(&client, &peer, &data_dir),
            health: HealthCheck {
                url: client.url(),
                path: HEALTH_PATH.to_string(),
                ca_pem: None,
            },
        })?;
        process.start(log.try_clone()?, log)?;

        info!(url = %client, "etcd started");
        self.endpoint = Some(client);
        self.process = Some(process);
        Ok(())
    }

    /// Block until `/health` answers
    pub async fn wait_ready(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::process_lifecycle("etcd was never started"))?;
        process.wait_ready(cancel, timeout).await
    }

    /// Stop etcd and delete its data directory
    ///
    /// The data directory is removed even if stopping the process failed; the
    /// first error is returned.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let stopped = match self.process.take() {
            Some(mut process) => process.stop(grace).await,
            None => Ok(()),
        };
        if let Err(e) = &stopped {
            warn!(error = %e, "failed to stop etcd, removing data dir anyway");
        }

        let data_dir = self.data_dir();
        let removed = match std::fs::remove_dir_all(&data_dir) {
            Ok(()) => {
                debug!(path = %data_dir.display(), "removed etcd data dir");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        };

        stopped.and(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_wire_client_and_peer_urls() {
        let client = ServiceEndpoint::new("http", "127.0.0.1", 2379);
        let peer = ServiceEndpoint::new("http", "127.0.0.1", 2380);
        let args = Etcd::args(&client, &peer, Path::new("/work/kubernetes/etcd/data"));
        assert_eq!(
            args,
            vec![
                "--listen-client-urls=http://127.0.0.1:2379",
                "--advertise-client-urls=http://127.0.0.1:2379",
                "--listen-peer-urls=http://127.0.0.1:2380",
                "--data-dir=/work/kubernetes/etcd/data",
            ]
        );
    }

    #[test]
    fn data_dir_lives_under_work_dir() {
        let etcd = Etcd::new(PathBuf::from("etcd"), Path::new("/work"));
        assert_eq!(etcd.data_dir(), PathBuf::from("/work/kubernetes/etcd/data"));
        assert!(etcd.endpoint().is_none());
    }

    #[tokio::test]
    async fn stop_removes_data_dir_even_if_never_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut etcd = Etcd::new(PathBuf::from("etcd"), dir.path());
        std::fs::create_dir_all(etcd.data_dir().join("member")).unwrap();

        etcd.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!etcd.data_dir().exists());
        etcd.stop(Duration::from_secs(1)).await.unwrap();
    }

    fn fake_etcd(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("etcd");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Story: teardown of a running member
    ///
    /// The process is terminated and the data directory goes with it.
    #[tokio::test]
    async fn story_stop_terminates_member_and_removes_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut etcd = Etcd::new(fake_etcd(dir.path()), &dir.path().join("work"));
        etcd.start().unwrap();
        assert!(etcd.endpoint().is_some());
        std::fs::create_dir_all(etcd.data_dir().join("member")).unwrap();

        etcd.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!etcd.data_dir().exists());
    }

    /// Story: the data directory cannot be removed
    ///
    /// The member is still stopped and the removal failure is reported.
    #[tokio::test]
    async fn story_data_dir_failure_does_not_skip_process_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut etcd = Etcd::new(fake_etcd(dir.path()), &dir.path().join("work"));
        etcd.start().unwrap();
        let data_dir = etcd.data_dir();
        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, "not a directory").unwrap();

        let err = etcd.stop(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)), "unexpected error: {}", err);
        assert!(etcd.process.is_none());

        std::fs::remove_file(&data_dir).unwrap();
        etcd.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut etcd = Etcd::new(dir.path().join("no-such-etcd"), dir.path());
        assert!(etcd.start().unwrap_err().is_configuration());
        assert!(dir.path().join("kubernetes/etcd/etcd.log").exists());
        etcd.stop(Duration::from_secs(1)).await.unwrap();
    }
}
