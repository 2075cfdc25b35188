//! kbb8 - local Cluster API management plane in a few seconds

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kbb8::config::Config;
use kbb8::controlplane::ControlPlane;
use kbb8::credentials;
use kbb8::provider::{Orchestrator, Provider};

/// kbb8 - run etcd, kube-apiserver and Cluster API providers as local processes
#[derive(Parser, Debug)]
#[command(name = "kbb8", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the control plane and every provider, then wait for Ctrl-C
    ///
    /// Everything is torn down in reverse order on exit, including the
    /// kubeconfig entry.
    Up(UpArgs),

    /// Remove a kubeconfig entry left behind by a crashed run
    Down(DownArgs),
}

#[derive(Parser, Debug)]
struct UpArgs {
    /// YAML run configuration; built-in defaults otherwise
    #[arg(short = 'f', long = "config", env = "KBB8_CONFIG")]
    config_file: Option<PathBuf>,

    /// Kubeconfig to publish the context into
    #[arg(long, env = "KBB8_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Cluster name the kubeconfig entry is derived from
    #[arg(long)]
    cluster_name: Option<String>,
}

#[derive(Parser, Debug)]
struct DownArgs {
    /// Cluster name the kubeconfig entry was derived from
    #[arg(long, default_value = kbb8::config::DEFAULT_CLUSTER_NAME)]
    cluster_name: String,

    /// Kubeconfig to remove the entry from; every KUBECONFIG file otherwise
    #[arg(long, env = "KBB8_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install the rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Up(args) => run_up(args).await,
        Commands::Down(args) => run_down(args),
    }
}

fn load_config(args: &UpArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config_file {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(kubeconfig) = &args.kubeconfig {
        config.kubeconfig = Some(kubeconfig.clone());
    }
    if let Some(name) = &args.cluster_name {
        config.cluster_name = name.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Bring everything up, wait for Ctrl-C, tear everything down
async fn run_up(args: UpArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
        }
        on_signal.cancel();
    });

    let mut control_plane = ControlPlane::new(config.control_plane_options());
    if let Err(e) = control_plane.start(&cancel).await {
        error!(error = %e, "control plane failed to start");
        if let Err(stop_err) = control_plane.stop().await {
            warn!(error = %stop_err, "control plane teardown failed");
        }
        return Err(e.into());
    }

    let (kubeconfig, context) = match (control_plane.kubeconfig_path(), control_plane.context()) {
        (Some(path), Some(context)) => (path.to_path_buf(), context.to_string()),
        _ => {
            control_plane.stop().await?;
            anyhow::bail!("control plane started without publishing credentials");
        }
    };
    println!("Kubernetes Ready!");

    let settings = config.provider_settings(&kubeconfig, Some(&context));
    let providers = config
        .providers
        .iter()
        .cloned()
        .map(|spec| Provider::new(spec, settings.clone()))
        .collect();
    let orchestrator = Orchestrator::new(providers);

    let outcome = orchestrator.start_all(&cancel).await.into_result();
    match &outcome {
        Ok(ready) => {
            println!("Cluster API with {} Ready!", ready.join(", "));
            println!("Set kubectl context to {:?}", context);
            cancel.cancelled().await;
        }
        Err(e) => error!(error = %e, "providers failed to start"),
    }

    let providers_stopped = orchestrator.stop_all().await;
    let control_plane_stopped = control_plane.stop().await;

    outcome?;
    providers_stopped?;
    control_plane_stopped?;
    println!("Stopped");
    Ok(())
}

/// Remove the kubeconfig entry of a previous run
fn run_down(args: DownArgs) -> anyhow::Result<()> {
    credentials::remove(&args.cluster_name, args.kubeconfig.as_deref())?;
    println!("Removed kubeconfig entry for {}", args.cluster_name);
    Ok(())
}
