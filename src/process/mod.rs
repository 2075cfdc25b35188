//! Supervisor for one external executable
//!
//! A [`ProcessHandle`] owns exactly one child process: it assembles the
//! command line, redirects stdout/stderr into caller-owned log files, polls an
//! HTTP(S) health endpoint and terminates the process on [`ProcessHandle::stop`].
//!
//! Readiness is never awaited implicitly. `start` returns as soon as the
//! process is spawned and the owner decides when (and whether) to call
//! [`ProcessHandle::wait_ready`].

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::poll::wait_until;
use crate::{Error, Result, POLL_INTERVAL};

/// Default time a process gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Timeout for a single health request
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// HTTP(S) endpoint that reports readiness with a 2xx status
#[derive(Clone, Debug, Default)]
pub struct HealthCheck {
    /// Base URL, e.g. `https://127.0.0.1:6443`
    pub url: String,
    /// Path appended to the URL, e.g. `/readyz`
    pub path: String,
    /// PEM bundle to trust for HTTPS. Without it the endpoint's certificate
    /// is not verified.
    pub ca_pem: Option<String>,
}

impl HealthCheck {
    /// Full URL polled for readiness
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.path)
    }
}

/// What to run and how to tell it is ready
#[derive(Clone, Debug, Default)]
pub struct ProcessSpec {
    /// Executable path
    pub path: PathBuf,
    /// Flat argument list, no shell interpretation
    pub args: Vec<String>,
    /// Readiness endpoint
    pub health: HealthCheck,
}

/// One supervised process
pub struct ProcessHandle {
    spec: ProcessSpec,
    http: reqwest::Client,
    child: Option<Child>,
    ready: bool,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("path", &self.spec.path)
            .field("pid", &self.pid())
            .field("ready", &self.ready)
            .finish()
    }
}

impl ProcessHandle {
    /// Validate the process spec and prepare the health client
    ///
    /// Nothing is spawned and nothing is written to disk.
    pub fn init(spec: ProcessSpec) -> Result<Self> {
        if spec.path.as_os_str().is_empty() {
            return Err(Error::configuration("process path must not be empty"));
        }
        if spec.health.url.is_empty() {
            return Err(Error::configuration(format!(
                "health check URL for {} must not be empty",
                spec.path.display()
            )));
        }

        let http = health_client(&spec.health)?;

        Ok(Self {
            spec,
            http,
            child: None,
            ready: false,
        })
    }

    /// Executable path
    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    /// Argument list passed to the executable
    pub fn args(&self) -> &[String] {
        &self.spec.args
    }

    /// OS process id while the process is running
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Outcome of the last health poll
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Spawn the process with stdout and stderr redirected to the given files
    pub fn start(&mut self, stdout: File, stderr: File) -> Result<()> {
        if self.child.is_some() {
            return Err(Error::process_lifecycle(format!(
                "{} is already started",
                self.spec.path.display()
            )));
        }

        let mut cmd = Command::new(&self.spec.path);
        cmd.args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Error::configuration(format!(
                    "unable to execute {}: {}",
                    self.spec.path.display(),
                    e
                ))
            }
            _ => Error::process_lifecycle(format!(
                "failed to spawn {}: {}",
                self.spec.path.display(),
                e
            )),
        })?;

        info!(
            path = %self.spec.path.display(),
            pid = ?child.id(),
            "process started"
        );
        self.child = Some(child);
        self.ready = false;
        Ok(())
    }

    /// Issue one health request and record the outcome
    pub async fn poll_once(&mut self) -> bool {
        self.ready = check_health(&self.http, &self.spec.health.endpoint()).await;
        self.ready
    }

    /// Poll the health endpoint every 100ms until it succeeds
    ///
    /// Fails with a process lifecycle error as soon as the process exits, and
    /// with a readiness timeout when `cancel` fires or `timeout` elapses.
    pub async fn wait_ready(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let path = self.spec.path.display().to_string();
        let endpoint = self.spec.health.endpoint();
        let http = self.http.clone();
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| Error::process_lifecycle(format!("{} was never started", path)))?;

        let result = wait_until(cancel, POLL_INTERVAL, timeout, &endpoint, || {
            let exited = child.try_wait();
            let http = http.clone();
            let endpoint = endpoint.clone();
            let path = path.clone();
            async move {
                match exited {
                    Ok(None) => Ok(check_health(&http, &endpoint).await),
                    Ok(Some(status)) => Err(Error::process_lifecycle(format!(
                        "{} exited before becoming ready: {}",
                        path, status
                    ))),
                    Err(e) => Err(Error::process_lifecycle(format!(
                        "failed to query {}: {}",
                        path, e
                    ))),
                }
            }
        })
        .await;

        self.ready = result.is_ok();
        match result {
            Ok(()) => {
                debug!(path = %path, endpoint = %endpoint, "process ready");
                Ok(())
            }
            Err(Error::ReadinessTimeout(msg)) => Err(Error::readiness_timeout(format!(
                "error starting {}: {}",
                path, msg
            ))),
            Err(e) => Err(e),
        }
    }

    /// Terminate the process: SIGTERM, then SIGKILL after `grace`
    ///
    /// Safe to call repeatedly and on a handle that was never started.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        self.ready = false;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let path = self.spec.path.display().to_string();

        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::process_lifecycle(format!("failed to query {}: {}", path, e)))?
        {
            debug!(path = %path, %status, "process already exited");
            return Ok(());
        }

        if let Some(pid) = child.id() {
            let pid = i32::try_from(pid)
                .map_err(|_| Error::process_lifecycle(format!("invalid pid {} for {}", pid, path)))?;
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                // ESRCH: exited between try_wait and kill
                if e != nix::errno::Errno::ESRCH {
                    return Err(Error::process_lifecycle(format!(
                        "failed to signal {}: {}",
                        path, e
                    )));
                }
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(path = %path, %status, "process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::process_lifecycle(format!(
                "failed to wait for {}: {}",
                path, e
            ))),
            Err(_) => {
                warn!(path = %path, ?grace, "process ignored SIGTERM, killing");
                child.kill().await.map_err(|e| {
                    Error::process_lifecycle(format!("failed to kill {}: {}", path, e))
                })
            }
        }
    }
}

async fn check_health(http: &reqwest::Client, endpoint: &str) -> bool {
    match http.get(endpoint).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            trace!(endpoint = %endpoint, error = %e, "health check failed");
            false
        }
    }
}

fn health_client(health: &HealthCheck) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(HEALTH_REQUEST_TIMEOUT);
    builder = match &health.ca_pem {
        Some(pem) => {
            let certs = reqwest::Certificate::from_pem_bundle(pem.as_bytes()).map_err(|e| {
                Error::configuration(format!("invalid health check CA bundle: {}", e))
            })?;
            if certs.is_empty() {
                return Err(Error::configuration(
                    "health check CA bundle holds no PEM certificates",
                ));
            }
            certs
                .into_iter()
                .fold(builder, |builder, cert| builder.add_root_certificate(cert))
        }
        None => builder.danger_accept_invalid_certs(true),
    };
    builder
        .build()
        .map_err(|e| Error::configuration(format!("failed to build health client: {}", e)))
}

/// Open (creating if needed) an append-only log file at `dir/file_name`
pub fn open_log_file(dir: &Path, file_name: &str) -> Result<File> {
    std::fs::create_dir_all(dir).map_err(|e| {
        Error::resource_allocation(format!("failed to create {}: {}", dir.display(), e))
    })?;
    let path = dir.join(file_name);
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| {
            Error::resource_allocation(format!("failed to open log {}: {}", path.display(), e))
        })
}
