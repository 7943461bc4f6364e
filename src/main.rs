//! # Revision controller binary
//!
//! `check` validates a controller config. `run` starts the controller in
//! local mode against in-memory stores, optionally seeded from a JSON file,
//! until Ctrl-C.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use revision_reconciler::{
    ConfigMap, ControllerConfig, EventSources, InMemoryConfigStore, InMemoryOperatorClient,
    RevisionController, Secret, TracingEventRecorder, stop_signal,
};

#[derive(Parser)]
#[command(name = "revision-controller")]
#[command(about = "Numbered, immutable snapshots of config maps and secrets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a config file
    Check {
        /// Path to the controller TOML config
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the controller against in-memory stores
    Run {
        /// Path to the controller TOML config
        #[arg(long)]
        config: PathBuf,

        /// JSON file with config maps and secrets to preload
        #[arg(long)]
        seed: Option<PathBuf>,
    },
}

/// Objects preloaded into the in-memory store.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Seed {
    #[serde(default)]
    config_maps: Vec<ConfigMap>,
    #[serde(default)]
    secrets: Vec<Secret>,
}

impl Seed {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))
    }

    /// Objects without a namespace land in `namespace`.
    async fn into_store(self, namespace: &str, store: &InMemoryConfigStore) {
        for mut config_map in self.config_maps {
            if config_map.metadata.namespace.is_empty() {
                config_map.metadata.namespace = namespace.to_string();
            }
            store.put_config_map(config_map).await;
        }
        for mut secret in self.secrets {
            if secret.metadata.namespace.is_empty() {
                secret.metadata.namespace = namespace.to_string();
            }
            store.put_secret(secret).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Check { config } => check(&config),
        Command::Run { config, seed } => run(&config, seed.as_deref()).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn check(path: &Path) -> Result<()> {
    let config = ControllerConfig::load(path)
        .with_context(|| format!("Invalid controller config {}", path.display()))?;

    println!("namespace:   {}", config.target_namespace);
    println!("config maps: {}", config.config_maps.join(", "));
    println!("secrets:     {}", config.secrets.join(", "));
    println!(
        "backoff:     {}ms x{} (cap {}ms)",
        config.backoff.base_delay_ms, config.backoff.multiplier, config.backoff.max_delay_ms
    );
    Ok(())
}

async fn run(config_path: &Path, seed_path: Option<&Path>) -> Result<()> {
    let config = ControllerConfig::load(config_path)
        .with_context(|| format!("Invalid controller config {}", config_path.display()))?;

    let client = Arc::new(InMemoryOperatorClient::new());
    let store = Arc::new(InMemoryConfigStore::new());

    if let Some(path) = seed_path {
        let seed = Seed::load(path)?;
        info!(
            config_maps = seed.config_maps.len(),
            secrets = seed.secrets.len(),
            "Seeding in-memory store"
        );
        seed.into_store(&config.target_namespace, &store).await;
    }

    let sources = EventSources {
        operator: client.subscribe(),
        config_maps: store.subscribe_config_maps(),
        secrets: store.subscribe_secrets(),
    };
    let controller = Arc::new(RevisionController::new(
        &config,
        client.clone(),
        store,
        Arc::new(TracingEventRecorder::new("revision-controller")),
    ));

    let (stopper, stop_rx) = stop_signal();
    let handle = tokio::spawn(controller.run(sources, stop_rx));

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    stopper.stop();

    if let Err(e) = handle.await {
        warn!(error = %e, "Controller task ended abnormally");
    }

    let status = client.status().await;
    info!(
        latest_available_revision = status.latest_available_revision,
        "Final operator status"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use std::io::Write;

    use revision_reconciler::ConfigStore;

    const SEED: &str = r#"{
        "configMaps": [
            { "metadata": { "name": "pod" }, "data": { "pod.yaml": "kind: Pod" } },
            { "metadata": { "namespace": "other", "name": "config" } }
        ],
        "secrets": [
            { "metadata": { "name": "serving-cert" }, "data": { "tls.crt": [1, 2, 3] } }
        ]
    }"#;

    #[tokio::test]
    async fn test_seed_defaults_namespace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();

        let seed = Seed::load(file.path()).unwrap();
        let store = InMemoryConfigStore::new();
        seed.into_store("target", &store).await;

        let pod = store.get_config_map("target", "pod").await.unwrap();
        assert_eq!(pod.data.get("pod.yaml").map(String::as_str), Some("kind: Pod"));
        assert!(store.get_config_map("other", "config").await.is_ok());

        let cert = store.get_secret("target", "serving-cert").await.unwrap();
        assert_eq!(cert.data.get("tls.crt"), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn test_seed_rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(Seed::load(file.path()).is_err());
    }
}
