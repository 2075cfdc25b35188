//! End-to-end bootstrap tests
//!
//! These need real binaries and are ignored by default. Point
//! `KBB8_PACKAGES_DIR` at a directory laid out like `test/packages`:
//!
//! ```text
//! $KBB8_PACKAGES_DIR/bootstrap-kubernetes/{etcd,kube-apiserver}
//! $KBB8_PACKAGES_DIR/bootstrap-capi/{manager,components.yaml}
//! ...
//! ```
//!
//! ```bash
//! KBB8_PACKAGES_DIR=$PWD/test/packages cargo test --test bootstrap -- --ignored --nocapture
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kbb8::config::{default_providers, Config};
use kbb8::controlplane::{ControlPlane, Stage};
use kbb8::credentials;
use kbb8::provider::{kube_client, Orchestrator, Provider, ProviderSpec};

fn packages_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("KBB8_PACKAGES_DIR").unwrap_or_else(|_| "./test/packages".to_string()),
    )
}

fn config(dir: &Path) -> Config {
    Config {
        control_plane_package_path: packages_dir().join("bootstrap-kubernetes"),
        cluster_name: "e2e".to_string(),
        kubeconfig: Some(dir.join("kubeconfig")),
        work_dir: dir.join("work"),
        process_ready_timeout_secs: Some(60),
        stop_grace_period_secs: 5,
        ..Config::default()
    }
}

// =============================================================================
// Story Tests: Bootstrapping a Management Plane
// =============================================================================

/// Story: bring up etcd and kube-apiserver, use them, tear them down
///
/// The published context reaches a working API server, and teardown removes
/// both the kubeconfig entry and the etcd data directory.
#[tokio::test]
#[ignore]
async fn story_control_plane_round_trip() {
    kbb8::install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let kubeconfig = dir.path().join("kubeconfig");

    let mut cp = ControlPlane::new(config.control_plane_options());
    let started = cp.start(&CancellationToken::new()).await;
    if let Err(e) = started {
        cp.stop().await.ok();
        panic!("control plane failed to start: {}", e);
    }
    assert_eq!(cp.stage(), Stage::CredentialsPublished);

    let context = cp.context().unwrap().to_string();
    assert!(!context.is_empty());
    assert!(credentials::read_file(&kubeconfig)
        .unwrap()
        .context_names()
        .contains(&context.as_str()));

    let client = kube_client(&kubeconfig, Some(&context)).await.unwrap();
    let version = client.apiserver_version().await.unwrap();
    assert!(!version.git_version.is_empty());

    cp.stop().await.unwrap();
    assert_eq!(cp.stage(), Stage::Stopped);
    assert!(!credentials::read_file(&kubeconfig)
        .unwrap()
        .context_names()
        .contains(&context.as_str()));
    assert!(!dir.path().join("work/kubernetes/etcd/data").exists());
}

/// Story: the full stack with the stock Cluster API providers
#[tokio::test]
#[ignore]
async fn story_full_bootstrap_with_core_providers() {
    kbb8::install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.providers = default_providers()
        .into_iter()
        .map(|spec| {
            let base = spec.package_path.file_name().unwrap().to_owned();
            ProviderSpec {
                package_path: packages_dir().join(base),
                args: spec.args,
            }
        })
        .collect();

    let mut cp = ControlPlane::new(config.control_plane_options());
    let cancel = CancellationToken::new();
    cp.start(&cancel).await.unwrap();

    let settings = config.provider_settings(cp.kubeconfig_path().unwrap(), cp.context());
    let orchestrator = Orchestrator::new(
        config
            .providers
            .iter()
            .cloned()
            .map(|spec| Provider::new(spec, settings.clone()))
            .collect(),
    );

    let report = tokio::time::timeout(Duration::from_secs(300), orchestrator.start_all(&cancel))
        .await
        .unwrap();
    let stopped = orchestrator.stop_all().await;
    cp.stop().await.unwrap();

    assert_eq!(
        report.into_result().unwrap(),
        vec!["CAPI", "CABPK", "KCP", "CAPD"]
    );
    stopped.unwrap();
}

/// Story: two providers, one of which has no usable package
///
/// The broken provider is reported by name and the healthy one still comes
/// up; teardown stops whatever started.
#[tokio::test]
#[ignore]
async fn story_broken_provider_is_reported_by_name() {
    kbb8::install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let mut cp = ControlPlane::new(config.control_plane_options());
    let cancel = CancellationToken::new();
    cp.start(&cancel).await.unwrap();

    let settings = config.provider_settings(cp.kubeconfig_path().unwrap(), cp.context());
    let orchestrator = Orchestrator::new(vec![
        Provider::new(
            ProviderSpec::new(packages_dir().join("bootstrap-capi"), &[]),
            settings.clone(),
        ),
        Provider::new(
            ProviderSpec::new(dir.path().join("bootstrap-y"), &[]),
            settings,
        ),
    ]);

    let report = orchestrator.start_all(&cancel).await;
    orchestrator.stop_all().await.unwrap();
    cp.stop().await.unwrap();

    assert_eq!(report.ready, vec!["CAPI"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "Y");
}
