//! Run configuration
//!
//! Everything is optional: an empty file (or no file) reproduces the stock
//! Cluster API bootstrap with the four core providers.
//!
//! ```yaml
//! controlPlanePackagePath: ./test/packages/bootstrap-kubernetes
//! clusterName: bootstrap
//! providers:
//! - packagePath: ./test/packages/bootstrap-capi
//!   args: ["--feature-gates=MachinePool=true"]
//! objectReadyTimeoutSecs: 60
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controlplane::ControlPlaneOptions;
use crate::provider::{ProviderSettings, ProviderSpec};
use crate::{Error, Result, DEFAULT_WORK_DIR};

/// Default control plane package
pub const DEFAULT_CONTROL_PLANE_PACKAGE: &str = "./test/packages/bootstrap-kubernetes";

/// Default cluster name used for the kubeconfig entry
pub const DEFAULT_CLUSTER_NAME: &str = "bootstrap";

/// Full run configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Directory holding the `etcd` and `kube-apiserver` binaries
    pub control_plane_package_path: PathBuf,
    /// Name the kubeconfig entry is derived from
    pub cluster_name: String,
    /// Kubeconfig override; `KUBECONFIG` / `~/.kube/config` otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// Root for logs, PKI and data
    pub work_dir: PathBuf,
    /// Providers to start
    pub providers: Vec<ProviderSpec>,
    /// Bound for each process readiness wait; unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_ready_timeout_secs: Option<u64>,
    /// Bound for each object readiness wait
    pub object_ready_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace_period_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_plane_package_path: PathBuf::from(DEFAULT_CONTROL_PLANE_PACKAGE),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            kubeconfig: None,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            providers: default_providers(),
            process_ready_timeout_secs: None,
            object_ready_timeout_secs: 60,
            stop_grace_period_secs: 10,
        }
    }
}

/// The core Cluster API providers with the feature gates kbb8 enables
pub fn default_providers() -> Vec<ProviderSpec> {
    vec![
        ProviderSpec::new(
            "./test/packages/bootstrap-capi",
            &["--feature-gates=MachinePool=true,ClusterResourceSet=true,ClusterTopology=true"],
        ),
        ProviderSpec::new(
            "./test/packages/bootstrap-cabpk",
            &["--feature-gates=MachinePool=true"],
        ),
        ProviderSpec::new(
            "./test/packages/bootstrap-kcp",
            &["--feature-gates=ClusterTopology=true"],
        ),
        ProviderSpec::new(
            "./test/packages/bootstrap-capd",
            &[
                "--feature-gates=MachinePool=true,ClusterTopology=true",
                "--loadbalancer-use-host-port",
            ],
        ),
    ]
}

impl Config {
    /// Load from a YAML file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse YAML and validate; an empty document yields the defaults
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| Error::configuration(format!("invalid config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that cannot produce a working run
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::configuration("clusterName must not be empty"));
        }
        if self.control_plane_package_path.as_os_str().is_empty() {
            return Err(Error::configuration(
                "controlPlanePackagePath must not be empty",
            ));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.package_path.as_os_str().is_empty() {
                return Err(Error::configuration("provider packagePath must not be empty"));
            }
            let name = provider.name();
            if name.is_empty() {
                return Err(Error::configuration(format!(
                    "cannot derive a provider name from {}",
                    provider.package_path.display()
                )));
            }
            if !names.insert(name.clone()) {
                return Err(Error::configuration(format!(
                    "duplicate provider {} ({})",
                    name,
                    provider.package_path.display()
                )));
            }
        }
        Ok(())
    }

    /// Grace period as a duration
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// Process readiness bound as a duration
    pub fn process_ready_timeout(&self) -> Option<Duration> {
        self.process_ready_timeout_secs.map(Duration::from_secs)
    }

    /// Object readiness bound as a duration
    pub fn object_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.object_ready_timeout_secs)
    }

    /// Options for the control plane bootstrapper
    pub fn control_plane_options(&self) -> ControlPlaneOptions {
        ControlPlaneOptions {
            package_path: self.control_plane_package_path.clone(),
            work_dir: self.work_dir.clone(),
            cluster_name: self.cluster_name.clone(),
            kubeconfig: self.kubeconfig.clone(),
            ready_timeout: self.process_ready_timeout(),
            stop_grace: self.stop_grace(),
        }
    }

    /// Settings shared by all providers, given the published credentials
    pub fn provider_settings(&self, kubeconfig: &Path, context: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            kubeconfig: kubeconfig.to_path_buf(),
            context: context.map(str::to_string),
            work_dir: self.work_dir.clone(),
            process_ready_timeout: self.process_ready_timeout(),
            object_ready_timeout: Some(self.object_ready_timeout()),
            stop_grace: self.stop_grace(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_stock_bootstrap() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cluster_name, "bootstrap");
        assert_eq!(
            config.control_plane_package_path,
            PathBuf::from("./test/packages/bootstrap-kubernetes")
        );
        let names: Vec<_> = config.providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["CAPI", "CABPK", "KCP", "CAPD"]);
        assert_eq!(config.providers[3].args.len(), 2);
        assert_eq!(config.stop_grace(), Duration::from_secs(10));
        assert_eq!(config.object_ready_timeout(), Duration::from_secs(60));
        assert_eq!(config.process_ready_timeout(), None);
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = Config::from_yaml(
            "clusterName: dev\nprocessReadyTimeoutSecs: 30\nproviders:\n- packagePath: ./pkgs/bootstrap-x\n",
        )
        .unwrap();
        assert_eq!(config.cluster_name, "dev");
        assert_eq!(config.process_ready_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.work_dir, PathBuf::from(".tmp"));
    }

    #[test]
    fn empty_cluster_name_is_rejected() {
        let err = Config::from_yaml("clusterName: \"\"").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let err = Config::from_yaml(
            "providers:\n- packagePath: ./a/bootstrap-capi\n- packagePath: ./b/capi\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate provider CAPI"));
    }

    #[test]
    fn empty_provider_path_is_rejected() {
        let err = Config::from_yaml("providers:\n- packagePath: \"\"\n").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_yaml_shape_is_a_configuration_error() {
        let err = Config::from_yaml("providers: 3").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn options_carry_timeouts() {
        let mut config = Config::default();
        config.kubeconfig = Some(PathBuf::from("/tmp/kc"));
        config.stop_grace_period_secs = 2;

        let cp = config.control_plane_options();
        assert_eq!(cp.kubeconfig, Some(PathBuf::from("/tmp/kc")));
        assert_eq!(cp.stop_grace, Duration::from_secs(2));

        let settings = config.provider_settings(Path::new("/tmp/kc"), Some("kbb8-bootstrap"));
        assert_eq!(settings.context.as_deref(), Some("kbb8-bootstrap"));
        assert_eq!(settings.object_ready_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbb8.yaml");
        std::fs::write(&path, "clusterName: from-file\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().cluster_name, "from-file");
        assert!(Config::load(&dir.path().join("missing.yaml"))
            .unwrap_err()
            .is_configuration());
    }
}
