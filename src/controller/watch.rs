//! Watch streams feeding the work queue
//!
//! Each watch keeps a small cache of the last seen revision per key so
//! commands carry (old, new) pairs the way the worker expects them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints};
use kube::runtime::watcher::{self, watcher, Config};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::crd::{ClickHouseInstallation, ClickHouseInstallationTemplate};
use crate::model::labels::LABEL_CHI;

use super::queue::{Command, ReconcileAction, WorkQueue};

/// Label selecting the ConfigMap carrying operator settings
pub const OPERATOR_CONFIG_LABEL: &str = "clickhouse.example.com/operator-config";

fn object_key<K: Resource>(object: &K) -> (String, String) {
    (
        object.namespace().unwrap_or_default(),
        object.name_any(),
    )
}

/// Generic cache-backed watch translating platform events into commands.
async fn feed_queue<K>(
    api: Api<K>,
    config: Config,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
    mut make_command: impl FnMut(ReconcileAction, Option<Arc<K>>, Option<Arc<K>>) -> Command,
) where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let mut cache: HashMap<(String, String), Arc<K>> = HashMap::new();
    let mut stream = watcher(api, config).default_backoff().boxed();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            warn!("watch stream ended");
            return;
        };

        match event {
            Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                let object = Arc::new(object);
                let old = cache.insert(object_key(object.as_ref()), object.clone());
                let action = if old.is_some() {
                    ReconcileAction::Update
                } else {
                    ReconcileAction::Add
                };
                queue.add(make_command(action, old, Some(object)));
            }
            Ok(watcher::Event::Delete(object)) => {
                let object = Arc::new(object);
                cache.remove(&object_key(object.as_ref()));
                queue.add(make_command(ReconcileAction::Delete, Some(object), None));
            }
            Ok(watcher::Event::Init) => debug!("watch (re)initializing"),
            Ok(watcher::Event::InitDone) => debug!("watch cache primed"),
            Err(err) => error!("watch error: {}", err),
        }
    }
}

/// Watch installations and enqueue reconcile commands.
pub async fn watch_installations(
    client: Client,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    let api: Api<ClickHouseInstallation> = Api::all(client);
    feed_queue(api, Config::default(), queue, cancel, |action, old, new| {
        Command::ReconcileChi { action, old, new }
    })
    .await;
}

/// Watch installation templates and enqueue registry updates.
pub async fn watch_templates(client: Client, queue: Arc<WorkQueue>, cancel: CancellationToken) {
    let api: Api<ClickHouseInstallationTemplate> = Api::all(client);
    feed_queue(api, Config::default(), queue, cancel, |action, old, new| {
        Command::ReconcileChiTemplate { action, old, new }
    })
    .await;
}

/// Watch the operator configuration object.
pub async fn watch_operator_config(
    client: Client,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::all(client);
    let config = Config::default().labels(OPERATOR_CONFIG_LABEL);
    feed_queue(api, config, queue, cancel, |action, old, new| {
        Command::ReconcileOperatorConfig { action, old, new }
    })
    .await;
}

/// Watch endpoints of managed services; a change means pod IPs moved and
/// ClickHouse hosts must flush their DNS caches.
pub async fn watch_endpoints(client: Client, queue: Arc<WorkQueue>, cancel: CancellationToken) {
    let api: Api<Endpoints> = Api::all(client);
    let config = Config::default().labels(LABEL_CHI);
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut stream = watcher(api, config).default_backoff().boxed();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            warn!("endpoints watch stream ended");
            return;
        };

        match event {
            Ok(watcher::Event::InitApply(endpoints)) => {
                seen.insert(object_key(&endpoints));
            }
            Ok(watcher::Event::Apply(endpoints)) => {
                // Only a change to known endpoints signals moved IPs.
                if !seen.insert(object_key(&endpoints)) {
                    queue.add(Command::DropDns {
                        initiator: endpoints.metadata.clone(),
                    });
                }
            }
            Ok(watcher::Event::Delete(endpoints)) => {
                seen.remove(&object_key(&endpoints));
            }
            Ok(watcher::Event::Init) => debug!("endpoints watch (re)initializing"),
            Ok(watcher::Event::InitDone) => debug!("endpoints watch cache primed"),
            Err(err) => error!("endpoints watch error: {}", err),
        }
    }
}
