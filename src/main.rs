//! ClickHouse operator binary
//!
//! Connects to the cluster, verifies the CRDs are installed, wires the watch
//! streams into the work queue and runs the reconciliation worker until a
//! shutdown signal arrives.

use std::sync::{Arc, RwLock};

use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use clickhouse_operator::config::OperatorConfig;
use clickhouse_operator::controller::{
    watch_endpoints, watch_installations, watch_operator_config, watch_templates, WorkQueue,
    Worker,
};
use clickhouse_operator::crd::{ClickHouseInstallation, ClickHouseInstallationTemplate};
use clickhouse_operator::model::Normalizer;
use clickhouse_operator::schemer::HttpSchemer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clickhouse_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    if std::env::args().any(|arg| arg == "--generate-crds") {
        generate_crds()?;
        return Ok(());
    }

    info!("starting ClickHouse operator");

    let client = Client::try_default().await?;
    info!("connected to the cluster");

    // The operator cannot do anything useful without its CRDs.
    let installations: Api<ClickHouseInstallation> = Api::all(client.clone());
    if let Err(err) = installations.list(&Default::default()).await {
        error!(
            "ClickHouseInstallation CRD not found, install the CRDs first: {:?}",
            err
        );
        anyhow::bail!("ClickHouseInstallation CRD not installed");
    }

    let config = Arc::new(RwLock::new(OperatorConfig::from_env()));
    let schemer = {
        let config = config.read().expect("config poisoned");
        Arc::new(HttpSchemer::new(&config))
    };
    let queue = WorkQueue::new();
    let cancel = CancellationToken::new();
    let normalizer = Normalizer::new();

    tokio::spawn(watch_templates(
        client.clone(),
        queue.clone(),
        cancel.clone(),
    ));
    tokio::spawn(watch_operator_config(
        client.clone(),
        queue.clone(),
        cancel.clone(),
    ));
    tokio::spawn(watch_installations(
        client.clone(),
        queue.clone(),
        cancel.clone(),
    ));
    tokio::spawn(watch_endpoints(
        client.clone(),
        queue.clone(),
        cancel.clone(),
    ));

    let worker = Worker::new(
        client,
        config,
        queue.clone(),
        normalizer,
        schemer,
        cancel.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    queue.shut_down();
    let _ = worker_handle.await;

    Ok(())
}

fn generate_crds() -> anyhow::Result<()> {
    let chi = serde_yaml::to_string(&ClickHouseInstallation::crd())?;
    let chit = serde_yaml::to_string(&ClickHouseInstallationTemplate::crd())?;
    println!("{}\n---\n{}", chi, chit);
    Ok(())
}
