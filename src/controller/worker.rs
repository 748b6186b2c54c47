//! The reconciliation worker
//!
//! A worker drains the typed work queue and converges platform and database
//! state to the declared installation: structural diff via the action plan,
//! then a walk over aux objects, clusters, shards and hosts that stops at
//! the first error. Host changes roll through the exclude -> mutate ->
//! include protocol so peers never route to a host mid-change.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{ChiStatus, ClickHouseInstallation};
use crate::error::{Error, Result};
use crate::model::labels::LABEL_STATEFULSET_VERSION;
use crate::model::{
    labels, names, ConfigFilesGeneratorOptions, Creator, HostAttributeMap, NormalizedChi,
    NormalizedCluster, NormalizedHost, NormalizedShard, Normalizer, ReconcileAttributes,
    RemoteServersOptions,
};
use crate::schemer::Schemer;

use super::announcer::{Announcer, EventAction, EventReason};
use super::finalizers;
use super::plan::ActionPlan;
use super::queue::{Command, ReconcileAction, WorkQueue};

/// Classification of a host's existing StatefulSet against the desired one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatefulSetStatus {
    /// Absent on the platform
    New,
    /// Fingerprint labels match: nothing to change
    Same,
    /// Spec differs: a rolling change is required
    Modified,
    /// Fetch failed or the objects are not comparable
    Unknown,
}

/// State scoped to a single reconcile pass. Dropped when the pass ends; the
/// creator and attribute table never leak into the next reconcile.
struct ReconcileTask {
    chi: Arc<NormalizedChi>,
    creator: Creator,
    attributes: HostAttributeMap,
    status: ChiStatus,
}

impl ReconcileTask {
    fn new(chi: Arc<NormalizedChi>, attributes: HostAttributeMap, status: ChiStatus) -> Self {
        Self {
            creator: Creator::new(chi.clone()),
            chi,
            attributes,
            status,
        }
    }
}

/// A single-threaded cooperative reconcile loop over the work queue
pub struct Worker {
    client: Client,
    config: Arc<RwLock<OperatorConfig>>,
    queue: Arc<WorkQueue>,
    announcer: Announcer,
    normalizer: Normalizer,
    schemer: Arc<dyn Schemer>,
    cancel: CancellationToken,
    /// Installations under observation, by (namespace, name), with host FQDNs
    watched: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl Worker {
    pub fn new(
        client: Client,
        config: Arc<RwLock<OperatorConfig>>,
        queue: Arc<WorkQueue>,
        normalizer: Normalizer,
        schemer: Arc<dyn Schemer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            announcer: Announcer::new(client.clone()),
            client,
            config,
            queue,
            normalizer,
            schemer,
            cancel,
            watched: Mutex::new(HashMap::new()),
        }
    }

    fn operator_config(&self) -> OperatorConfig {
        self.config.read().expect("config poisoned").clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Endless work loop, expected to be spawned as a task.
    ///
    /// The first dequeue is deferred by the configured warmup so watch
    /// caches have time to fill.
    pub async fn run(self) {
        let warmup = self.operator_config().worker_warmup;
        debug!("worker warming up for {:?}", warmup);
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(warmup) => {}
        }

        loop {
            let Some(command) = self.queue.get().await else {
                info!("work queue shut down, worker exiting");
                return;
            };

            if let Err(err) = self.process_command(&command).await {
                // Errors are surfaced here, never re-enqueued by the worker;
                // the rate-limited queue owns retries.
                error!("command processing failed: {}", err);
            }

            self.queue.forget(&command);
            self.queue.done(&command);
        }
    }

    /// Dispatch one dequeued command by its tag.
    async fn process_command(&self, command: &Command) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        match command {
            Command::ReconcileChi { action, old, new } => match (action, old, new) {
                (ReconcileAction::Add, _, Some(new)) => self.update_chi(None, new.clone()).await,
                (ReconcileAction::Update, Some(old), Some(new)) => {
                    self.update_chi(Some(old.clone()), new.clone()).await
                }
                (ReconcileAction::Delete, Some(old), _) => self.delete_chi(old.clone()).await,
                _ => {
                    warn!("inconsistent installation command, dropping: {:?}", command);
                    Ok(())
                }
            },

            Command::ReconcileChiTemplate { action, old, new } => match (action, old, new) {
                (ReconcileAction::Add | ReconcileAction::Update, _, Some(new)) => {
                    info!("registering installation template {}", new.name_any());
                    self.normalizer.register_template(new);
                    Ok(())
                }
                (ReconcileAction::Delete, Some(old), _) => {
                    info!("unregistering installation template {}", old.name_any());
                    self.normalizer.unregister_template(old);
                    Ok(())
                }
                _ => {
                    warn!("inconsistent template command, dropping: {:?}", command);
                    Ok(())
                }
            },

            Command::ReconcileOperatorConfig { action, new, .. } => match (action, new) {
                (ReconcileAction::Add | ReconcileAction::Update, Some(new)) => {
                    let settings = new.data.clone().unwrap_or_default();
                    let updated = OperatorConfig::from_settings(&settings);
                    info!("operator configuration updated from {}", new.name_any());
                    *self.config.write().expect("config poisoned") = updated;
                    Ok(())
                }
                (ReconcileAction::Delete, _) => {
                    info!("operator configuration object deleted, reverting to environment");
                    *self.config.write().expect("config poisoned") = OperatorConfig::from_env();
                    Ok(())
                }
                _ => {
                    warn!("inconsistent configuration command, dropping: {:?}", command);
                    Ok(())
                }
            },

            Command::DropDns { initiator } => {
                self.drop_dns(initiator).await;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Installation reconcile
    // ========================================================================

    /// Converge one installation. `old` is `None` on the first sight of the
    /// object; otherwise both revisions come from the watch caches.
    async fn update_chi(
        &self,
        old: Option<Arc<ClickHouseInstallation>>,
        new: Arc<ClickHouseInstallation>,
    ) -> Result<()> {
        let update = old.is_some();

        if let Some(old) = &old {
            if old.metadata.resource_version == new.metadata.resource_version {
                debug!(
                    "resource version of {} did not change, nothing to do",
                    new.name_any()
                );
                return Ok(());
            }
        }

        if new.metadata.deletion_timestamp.is_some() {
            return self.finalize_chi(&new).await;
        }

        let api: Api<ClickHouseInstallation> = Api::namespaced(
            self.client.clone(),
            &new.namespace().unwrap_or_else(|| "default".to_string()),
        );
        if let Err(err) = finalizers::ensure_finalizer(&api, &new).await {
            warn!("unable to install finalizer on {}: {}", new.name_any(), err);
        }

        let old_normalized = match &old {
            Some(old) => Some(Arc::new(self.normalizer.normalize(old, true)?)),
            None => None,
        };
        let new_normalized = Arc::new(self.normalizer.normalize(&new, true)?);

        let plan = ActionPlan::new(old_normalized, new_normalized.clone());
        if !plan.has_actions() {
            debug!(
                "resource version of {} changed but no actual changes found",
                new.name_any()
            );
            return Ok(());
        }

        let mut status = new.status.clone().unwrap_or_default();
        status.clusters_count = new_normalized.clusters_count() as i32;
        status.shards_count = new_normalized.shards_count() as i32;
        status.hosts_count = new_normalized.hosts_count() as i32;
        status.fqdns = new_normalized.fqdns();
        status.reconcile_start(plan.removed_hosts_count() as i32);
        if let Err(err) = self.update_chi_status(&new_normalized, &status, false).await {
            warn!(
                "unable to write status of {}, the update will be redelivered: {}",
                new.name_any(),
                err
            );
            return Ok(());
        }

        self.announcer
            .event(
                &new_normalized,
                EventAction::Reconcile,
                EventReason::Started,
                format!("reconcile of {} started", new_normalized.name),
            )
            .await;

        if new_normalized.is_stopped() {
            self.delete_watch(&new_normalized.namespace, &new_normalized.name);
        }

        let attributes = stamp_attributes(&plan, &new_normalized, update);
        for host in new_normalized.hosts() {
            let attrs = attributes.get(&host.address);
            if attrs.add {
                info!("ADD host {}", host.address.short());
            } else if attrs.modify {
                info!("MODIFY host {}", host.address.short());
            } else if attrs.unclear {
                info!("UNCLEAR host {}", host.address.short());
            } else {
                info!("UNTOUCH host {}", host.address.short());
            }
        }

        let mut task = ReconcileTask::new(new_normalized.clone(), attributes, status);
        let reconcile_result = self.reconcile(&mut task).await;
        if self.is_cancelled() {
            // A cancelled reconcile releases the item without touching status.
            return Ok(());
        }
        if let Err(err) = reconcile_result {
            task.status.push_error(err.status_message());
            let _ = self.update_chi_status(&task.chi, &task.status, true).await;
            self.announcer
                .event(
                    &task.chi,
                    EventAction::Reconcile,
                    EventReason::Failed,
                    format!("reconcile failed: {}", err),
                )
                .await;
            return Ok(());
        }

        // Post-process added hosts: on an update reconcile the new hosts need
        // their table schemas; on first creation there is nothing to copy yet.
        let mut added_hosts: Vec<NormalizedHost> = Vec::new();
        plan.walk_added(|_| {}, |_| {}, |host| added_hosts.push(host.clone()));
        for host in &added_hosts {
            if update {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Started,
                        format!("adding tables on host {}", host.address.short()),
                    )
                    .await;
                if let Err(err) = self.schemer.host_create_tables(&task.chi, host).await {
                    error!("table creation on {} failed: {}", host.address, err);
                }
            } else {
                debug!(
                    "installation just created, no tables to add on host {}",
                    host.address.short()
                );
            }
        }

        // Remove items scheduled for deletion by the plan.
        let mut removed_clusters: Vec<NormalizedCluster> = Vec::new();
        let mut removed_shards: Vec<NormalizedShard> = Vec::new();
        let mut removed_hosts: Vec<NormalizedHost> = Vec::new();
        plan.walk_removed(
            |cluster| removed_clusters.push(cluster.clone()),
            |shard| removed_shards.push(shard.clone()),
            |host| removed_hosts.push(host.clone()),
        );
        for cluster in &removed_clusters {
            let _ = self.delete_cluster(&task.chi, &mut task.status, cluster).await;
        }
        for shard in &removed_shards {
            let _ = self.delete_shard(&task.chi, &mut task.status, shard).await;
        }
        for host in &removed_hosts {
            let _ = self.delete_host(&task.chi, &mut task.status, host).await;
        }

        if !task.chi.is_stopped() {
            self.update_watch(&task.chi);
        }

        task.status.reconcile_complete();
        let _ = self.update_chi_status(&task.chi, &task.status, false).await;
        self.announcer
            .event(
                &task.chi,
                EventAction::Reconcile,
                EventReason::Completed,
                format!("reconcile of {} completed", task.chi.name),
            )
            .await;

        Ok(())
    }

    /// Walk-till-error sequence over the installation tree
    async fn reconcile(&self, task: &mut ReconcileTask) -> Result<()> {
        let chi = task.chi.clone();

        self.reconcile_chi_aux_objects_preliminary(task).await?;
        for cluster in &chi.clusters {
            self.reconcile_cluster(task, cluster).await?;
        }
        for shard in chi.shards() {
            self.reconcile_shard(task, shard).await?;
        }
        for host in chi.hosts() {
            self.reconcile_host(task, host).await?;
        }
        self.reconcile_chi_aux_objects_final(task).await
    }

    /// Ensure the entry-point service and create (without update) the shared
    /// ConfigMaps before any host mounts them.
    async fn reconcile_chi_aux_objects_preliminary(&self, task: &mut ReconcileTask) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        if task.chi.is_stopped() {
            // A stopped installation must have no entry point.
            let _ = self
                .delete_service_if_exists(
                    &task.chi.namespace,
                    &names::chi_service_name(&task.chi.name),
                )
                .await;
        } else {
            let service = task.creator.service_chi();
            self.reconcile_service(task, service).await?;
        }

        self.reconcile_chi_config_maps(task, None, false).await
    }

    /// Re-reconcile the shared ConfigMaps with update enabled, publishing
    /// topology changes exactly once all hosts are converged.
    async fn reconcile_chi_aux_objects_final(&self, task: &mut ReconcileTask) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        self.reconcile_chi_config_maps(task, None, true).await
    }

    async fn reconcile_chi_config_maps(
        &self,
        task: &mut ReconcileTask,
        options: Option<&ConfigFilesGeneratorOptions>,
        update: bool,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let default_options = ConfigFilesGeneratorOptions::default();
        let options = options.unwrap_or(&default_options);

        let common = task.creator.config_map_chi_common(options, &task.attributes);
        self.reconcile_config_map(task, common, update).await?;

        let users = task.creator.config_map_chi_common_users();
        self.reconcile_config_map(task, users, update).await
    }

    async fn reconcile_cluster(
        &self,
        task: &mut ReconcileTask,
        cluster: &NormalizedCluster,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        let service = task.creator.service_cluster(cluster);
        self.reconcile_service(task, service).await
    }

    async fn reconcile_shard(
        &self,
        task: &mut ReconcileTask,
        shard: &NormalizedShard,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        let service = task.creator.service_shard(shard);
        self.reconcile_service(task, service).await
    }

    // ========================================================================
    // Host reconcile: exclude -> mutate -> include
    // ========================================================================

    async fn reconcile_host(&self, task: &mut ReconcileTask, host: &NormalizedHost) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        self.announcer
            .event(
                &task.chi,
                EventAction::Reconcile,
                EventReason::Started,
                format!("reconcile of host {} started", host.address.short()),
            )
            .await;
        task.status
            .push_action(format!("reconcile host {}", host.address.short()));

        let config_map = task.creator.config_map_host(host);
        let stateful_set = task.creator.stateful_set(host);
        let service = task.creator.service_host(host);
        let sts_status = self.stateful_set_status(&stateful_set).await;

        self.exclude_host(task, host, sts_status).await?;

        self.reconcile_config_map(task, config_map, true).await?;
        self.reconcile_stateful_set(task, stateful_set, host, sts_status)
            .await?;
        self.reconcile_persistent_volumes(task, host).await;
        self.reconcile_service(task, service).await?;

        task.attributes.update(&host.address, |a| a.add = false);

        if task.attributes.get(&host.address).migrate {
            self.announcer
                .event(
                    &task.chi,
                    EventAction::Create,
                    EventReason::Started,
                    format!("adding tables on host {}", host.address.short()),
                )
                .await;
            if let Err(err) = self.schemer.host_create_tables(&task.chi, host).await {
                // Data-plane convergence is best-effort; the next pass retries.
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Failed,
                        format!("table creation on host {} failed: {}", host.address.short(), err),
                    )
                    .await;
            }
        } else {
            debug!(
                "host {} was just created, no tables to migrate",
                host.address.short()
            );
        }

        self.include_host(task, host, sts_status).await?;

        task.attributes.update(&host.address, |a| a.reconciled = true);
        self.announcer
            .event(
                &task.chi,
                EventAction::Reconcile,
                EventReason::Completed,
                format!("reconcile of host {} completed", host.address.short()),
            )
            .await;

        Ok(())
    }

    /// Take the host out of the served topology before mutating it.
    ///
    /// Re-renders the shared topology ConfigMap without this host (and
    /// without never-yet-added hosts), then waits until the host no longer
    /// sees itself as a cluster member.
    async fn exclude_host(
        &self,
        task: &mut ReconcileTask,
        host: &NormalizedHost,
        status: StatefulSetStatus,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        if !should_wait_exclude_host(&self.operator_config(), &task.chi, host, status) {
            return Ok(());
        }

        info!("excluding host {} from the topology", host.address.short());
        let options = ConfigFilesGeneratorOptions::new().with_remote_servers(
            RemoteServersOptions::new()
                .exclude_host(host.address.clone())
                .exclude_reconcile_attributes(ReconcileAttributes::add()),
        );
        let _ = self.reconcile_chi_config_maps(task, Some(&options), true).await;
        let _ = self.poll_host_membership(host, false).await;

        Ok(())
    }

    /// Put the host back into the served topology, symmetric to exclusion.
    async fn include_host(
        &self,
        task: &mut ReconcileTask,
        host: &NormalizedHost,
        status: StatefulSetStatus,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let options = ConfigFilesGeneratorOptions::new().with_remote_servers(
            RemoteServersOptions::new()
                .exclude_reconcile_attributes(ReconcileAttributes::add()),
        );
        let _ = self.reconcile_chi_config_maps(task, Some(&options), true).await;

        if should_wait_include_host(&self.operator_config(), &task.chi, host, status) {
            info!("waiting for host {} to rejoin the topology", host.address.short());
            let _ = self.poll_host_membership(host, true).await;
        }

        Ok(())
    }

    /// Poll the host's cluster membership until it matches `want_member`,
    /// the poll times out, or the context is cancelled.
    async fn poll_host_membership(&self, host: &NormalizedHost, want_member: bool) -> Result<()> {
        let (interval, timeout) = {
            let config = self.operator_config();
            (config.host_poll_interval, config.host_poll_timeout)
        };
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_cancelled() {
                return Ok(());
            }
            if self.schemer.is_host_in_cluster(host).await == want_member {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("membership poll of host {} timed out", host.address.short());
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    // ========================================================================
    // Object reconcilers
    // ========================================================================

    async fn reconcile_config_map(
        &self,
        task: &mut ReconcileTask,
        config_map: ConfigMap,
        update: bool,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let namespace = config_map.namespace().unwrap_or_else(|| task.chi.namespace.clone());
        let name = config_map.name_any();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        match api.get_opt(&name).await {
            Ok(Some(current)) => {
                if !update {
                    return Ok(());
                }
                let mut desired = config_map;
                desired.metadata.resource_version = current.metadata.resource_version.clone();
                match api.replace(&name, &PostParams::default(), &desired).await {
                    Ok(_) => {
                        debug!("updated ConfigMap {}/{}", namespace, name);
                        Ok(())
                    }
                    Err(kube::Error::Api(e)) if e.code == 404 => {
                        self.create_config_map(task, desired).await
                    }
                    Err(err) => {
                        self.announcer
                            .event(
                                &task.chi,
                                EventAction::Update,
                                EventReason::Failed,
                                format!("update of ConfigMap {} failed: {}", name, err),
                            )
                            .await;
                        Err(Error::KubeError(err))
                    }
                }
            }
            Ok(None) => self.create_config_map(task, config_map).await,
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    async fn create_config_map(&self, task: &mut ReconcileTask, config_map: ConfigMap) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let namespace = config_map.namespace().unwrap_or_else(|| task.chi.namespace.clone());
        let name = config_map.name_any();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        match api.create(&PostParams::default(), &config_map).await {
            Ok(_) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Completed,
                        format!("created ConfigMap {}", name),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Failed,
                        format!("creation of ConfigMap {} failed: {}", name, err),
                    )
                    .await;
                Err(Error::KubeError(err))
            }
        }
    }

    async fn reconcile_service(&self, task: &mut ReconcileTask, service: Service) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let namespace = service.namespace().unwrap_or_else(|| task.chi.namespace.clone());
        let name = service.name_any();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);

        match api.get_opt(&name).await {
            Ok(Some(current)) => {
                // In-place update first; recreate only when the update fails
                // (immutable fields, conflicting spec).
                match self.update_service(task, &api, &current, service.clone()).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        warn!(
                            "update of Service {}/{} failed, recreating: {}",
                            namespace, name, err
                        );
                        let _ = self.delete_service_if_exists(&namespace, &name).await;
                        self.create_service(task, service).await
                    }
                }
            }
            Ok(None) => self.create_service(task, service).await,
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    async fn update_service(
        &self,
        task: &mut ReconcileTask,
        api: &Api<Service>,
        current: &Service,
        mut desired: Service,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        merge_service_for_update(&mut desired, current);

        let name = desired.name_any();
        match api.replace(&name, &PostParams::default(), &desired).await {
            Ok(_) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Update,
                        EventReason::Completed,
                        format!("updated Service {}", name),
                    )
                    .await;
                Ok(())
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    async fn create_service(&self, task: &mut ReconcileTask, service: Service) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let namespace = service.namespace().unwrap_or_else(|| task.chi.namespace.clone());
        let name = service.name_any();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);

        match api.create(&PostParams::default(), &service).await {
            Ok(_) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Completed,
                        format!("created Service {}", name),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Failed,
                        format!("creation of Service {} failed: {}", name, err),
                    )
                    .await;
                Err(Error::KubeError(err))
            }
        }
    }

    async fn stateful_set_status(&self, desired: &StatefulSet) -> StatefulSetStatus {
        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);

        match api.get_opt(&name).await {
            Ok(current) => classify_stateful_set(current.as_ref(), desired),
            Err(err) => {
                warn!("unable to fetch StatefulSet {}/{}: {}", namespace, name, err);
                StatefulSetStatus::Unknown
            }
        }
    }

    async fn reconcile_stateful_set(
        &self,
        task: &mut ReconcileTask,
        stateful_set: StatefulSet,
        host: &NormalizedHost,
        status: StatefulSetStatus,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        if status == StatefulSetStatus::Same {
            debug!(
                "StatefulSet of host {} is unchanged, no reconcile needed",
                host.address.short()
            );
            return Ok(());
        }

        let namespace = stateful_set.namespace().unwrap_or_else(|| task.chi.namespace.clone());
        let name = stateful_set.name_any();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);

        let result = match api.get_opt(&name).await {
            Ok(Some(current)) => {
                self.update_stateful_set(task, &api, current, stateful_set, host)
                    .await
            }
            Ok(None) => self.create_stateful_set(task, stateful_set, host).await,
            Err(err) => Err(Error::KubeError(err)),
        };

        if let Err(err) = &result {
            self.announcer
                .event(
                    &task.chi,
                    EventAction::Reconcile,
                    EventReason::Failed,
                    format!("reconcile of StatefulSet {} failed: {}", name, err),
                )
                .await;
        }
        result
    }

    async fn create_stateful_set(
        &self,
        task: &mut ReconcileTask,
        stateful_set: StatefulSet,
        host: &NormalizedHost,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let namespace = stateful_set.namespace().unwrap_or_else(|| task.chi.namespace.clone());
        let name = stateful_set.name_any();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);

        self.announcer
            .event(
                &task.chi,
                EventAction::Create,
                EventReason::Started,
                format!("creating StatefulSet {}", name),
            )
            .await;

        let result = api.create(&PostParams::default(), &stateful_set).await;

        task.status.added_hosts_count += 1;
        let _ = self.update_chi_status(&task.chi, &task.status, false).await;

        match result {
            Ok(_) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Completed,
                        format!("created StatefulSet {} for host {}", name, host.address.short()),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Create,
                        EventReason::Failed,
                        format!("creation of StatefulSet {} failed: {}", name, err),
                    )
                    .await;
                Err(Error::KubeError(err))
            }
        }
    }

    /// Update in place; on failure fall back to delete and recreate, with a
    /// PVC reconcile in between so claim growth is realized while the
    /// StatefulSet is down. The claims outlive the StatefulSet because they
    /// are separately owned.
    async fn update_stateful_set(
        &self,
        task: &mut ReconcileTask,
        api: &Api<StatefulSet>,
        current: StatefulSet,
        mut desired: StatefulSet,
        host: &NormalizedHost,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let name = desired.name_any();
        self.announcer
            .event(
                &task.chi,
                EventAction::Update,
                EventReason::Started,
                format!("updating StatefulSet {}", name),
            )
            .await;

        desired.metadata.resource_version = current.metadata.resource_version.clone();
        match api.replace(&name, &PostParams::default(), &desired).await {
            Ok(_) => {
                task.status.updated_hosts_count += 1;
                let _ = self.update_chi_status(&task.chi, &task.status, false).await;
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Update,
                        EventReason::Completed,
                        format!("updated StatefulSet {}", name),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.announcer
                    .event(
                        &task.chi,
                        EventAction::Update,
                        EventReason::Failed,
                        format!(
                            "update of StatefulSet {} failed, continuing with recreate: {}",
                            name, err
                        ),
                    )
                    .await;

                desired.metadata.resource_version = None;
                let _ = self.delete_stateful_set_object(&task.chi.namespace, &name).await;
                let _ = self.reconcile_persistent_volume_claims(task, host).await;
                self.create_stateful_set(task, desired, host).await
            }
        }
    }

    async fn delete_stateful_set_object(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    /// Stamp host metadata on the PersistentVolumes bound to the host's
    /// claims. Best-effort: failures are logged, never fatal.
    async fn reconcile_persistent_volumes(&self, task: &ReconcileTask, host: &NormalizedHost) {
        if self.is_cancelled() {
            return;
        }

        let pvc_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &host.address.namespace);
        let pv_api: Api<PersistentVolume> = Api::all(self.client.clone());

        for template in host.volume_claim_templates() {
            let pvc_name = names::pvc_name(&template.name, &host.address);
            let volume_name = match pvc_api.get_opt(&pvc_name).await {
                Ok(Some(pvc)) => pvc.spec.and_then(|s| s.volume_name),
                Ok(None) => None,
                Err(err) => {
                    warn!("unable to fetch PVC {}: {}", pvc_name, err);
                    None
                }
            };
            let Some(volume_name) = volume_name else { continue };

            match pv_api.get_opt(&volume_name).await {
                Ok(Some(pv)) => {
                    let prepared = task.creator.prepare_persistent_volume(pv, host);
                    if let Err(err) = pv_api
                        .replace(&volume_name, &PostParams::default(), &prepared)
                        .await
                    {
                        warn!("unable to update PersistentVolume {}: {}", volume_name, err);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("unable to fetch PersistentVolume {}: {}", volume_name, err),
            }
        }
    }

    /// Converge PVC resource requests toward the claim templates. Only
    /// resource names present on both sides are touched; absence of the PVC
    /// is tolerated silently (it may not be created yet).
    async fn reconcile_persistent_volume_claims(
        &self,
        task: &ReconcileTask,
        host: &NormalizedHost,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &host.address.namespace);

        for template in host.volume_claim_templates() {
            let pvc_name = names::pvc_name(&template.name, &host.address);
            let mut pvc = match api.get_opt(&pvc_name).await {
                Ok(Some(pvc)) => pvc,
                Ok(None) => continue,
                Err(err) => {
                    warn!("unable to fetch PVC {}/{}: {}", task.chi.namespace, pvc_name, err);
                    continue;
                }
            };

            let desired = template
                .spec
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref());
            let current = pvc
                .spec
                .as_ref()
                .and_then(|s| s.resources.as_ref())
                .and_then(|r| r.requests.as_ref());

            let Some(merged) = merged_resource_requests(current, desired) else {
                continue;
            };

            if let Some(resources) = pvc
                .spec
                .get_or_insert_with(Default::default)
                .resources
                .as_mut()
            {
                resources.requests = Some(merged);
            }
            if let Err(err) = api.replace(&pvc_name, &PostParams::default(), &pvc).await {
                warn!("unable to update PVC {}: {}", pvc_name, err);
            } else {
                debug!("updated resource requests of PVC {}", pvc_name);
            }
        }

        Ok(())
    }

    // ========================================================================
    // Finalization and teardown
    // ========================================================================

    /// Entered when a reconcile observes a deletion timestamp.
    async fn finalize_chi(&self, chi: &Arc<ClickHouseInstallation>) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let namespace = chi.namespace().unwrap_or_else(|| "default".to_string());
        let name = chi.name_any();
        let api: Api<ClickHouseInstallation> = Api::namespaced(self.client.clone(), &namespace);

        // Another actor may have finished the teardown already.
        let Some(current) = api.get_opt(&name).await? else {
            return Ok(());
        };
        if !current
            .finalizers()
            .iter()
            .any(|f| f == finalizers::FINALIZER_NAME)
        {
            return Ok(());
        }

        let normalized = self.normalizer.normalize(chi, true)?;
        let mut status = current.status.clone().unwrap_or_default();
        status.delete_start();
        let _ = self.update_chi_status(&normalized, &status, true).await;

        let _ = self.delete_chi(chi.clone()).await;

        if let Err(err) = finalizers::uninstall_finalizer(&api, &name).await {
            warn!("unable to uninstall finalizer of {}/{}: {}", namespace, name, err);
        }

        Ok(())
    }

    /// Delete everything the installation owns, children before parents.
    /// Individual failures are logged and the cascade continues; the first
    /// error is returned at the end.
    async fn delete_chi(&self, chi: Arc<ClickHouseInstallation>) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        // Templates must be reapplied to know what to delete.
        let normalized = match self.normalizer.normalize(&chi, true) {
            Ok(normalized) => Arc::new(normalized),
            Err(err) => {
                error!("unable to normalize {} for deletion: {}", chi.name_any(), err);
                return Err(err);
            }
        };

        self.announcer
            .event(
                &normalized,
                EventAction::Delete,
                EventReason::Started,
                format!("deletion of {} started", normalized.name),
            )
            .await;

        self.delete_watch(&normalized.namespace, &normalized.name);

        let mut status = chi.status.clone().unwrap_or_default();
        let mut first_error: Option<Error> = None;
        let mut record = |result: Result<()>| {
            if let Err(err) = result {
                error!("deletion step failed: {}", err);
                first_error.get_or_insert(err);
            }
        };

        for cluster in normalized.clusters.iter().rev() {
            record(self.delete_cluster(&normalized, &mut status, cluster).await);
        }

        if self.is_cancelled() {
            return Ok(());
        }

        record(
            self.delete_config_map_if_exists(
                &normalized.namespace,
                &names::common_config_map_name(&normalized.name),
            )
            .await,
        );
        record(
            self.delete_config_map_if_exists(
                &normalized.namespace,
                &names::users_config_map_name(&normalized.name),
            )
            .await,
        );
        record(
            self.delete_service_if_exists(
                &normalized.namespace,
                &names::chi_service_name(&normalized.name),
            )
            .await,
        );

        self.announcer
            .event(
                &normalized,
                EventAction::Delete,
                EventReason::Completed,
                format!("deletion of {} completed", normalized.name),
            )
            .await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_cluster(
        &self,
        chi: &NormalizedChi,
        status: &mut ChiStatus,
        cluster: &NormalizedCluster,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        self.announcer
            .event(
                chi,
                EventAction::Delete,
                EventReason::Started,
                format!("deleting cluster {}", cluster.address.cluster_name),
            )
            .await;

        let mut first_error: Option<Error> = None;
        for shard in cluster.shards.iter().rev() {
            if let Err(err) = self.delete_shard(chi, status, shard).await {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self
            .delete_service_if_exists(
                &cluster.address.namespace,
                &names::cluster_service_name(&cluster.address),
            )
            .await
        {
            first_error.get_or_insert(err);
        }

        self.announcer
            .event(
                chi,
                EventAction::Delete,
                EventReason::Completed,
                format!("deleted cluster {}", cluster.address.cluster_name),
            )
            .await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_shard(
        &self,
        chi: &NormalizedChi,
        status: &mut ChiStatus,
        shard: &NormalizedShard,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let mut first_error: Option<Error> = None;
        for host in shard.hosts.iter().rev() {
            if let Err(err) = self.delete_host(chi, status, host).await {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self
            .delete_service_if_exists(
                &shard.address.namespace,
                &names::shard_service_name(&shard.address),
            )
            .await
        {
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delete one host's platform objects, dropping its tables first when
    /// its volumes are about to be discarded (otherwise Zookeeper retains
    /// metadata of the dead replica).
    async fn delete_host(
        &self,
        chi: &NormalizedChi,
        status: &mut ChiStatus,
        host: &NormalizedHost,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        self.announcer
            .event(
                chi,
                EventAction::Delete,
                EventReason::Started,
                format!("deleting host {}", host.address.short()),
            )
            .await;

        let sts_api: Api<StatefulSet> =
            Api::namespaced(self.client.clone(), &host.address.namespace);
        let sts_name = names::stateful_set_name(&host.address);
        match sts_api.get_opt(&sts_name).await {
            Ok(None) => {
                self.announcer
                    .event(
                        chi,
                        EventAction::Delete,
                        EventReason::Completed,
                        format!("host {} already deleted", host.address.short()),
                    )
                    .await;
                return Ok(());
            }
            Ok(Some(_)) => {}
            Err(err) => warn!("unable to fetch StatefulSet {}: {}", sts_name, err),
        }

        let mut first_error: Option<Error> = None;
        let mut record = |result: Result<()>| {
            if let Err(err) = result {
                error!("host deletion step failed: {}", err);
                first_error.get_or_insert(err);
            }
        };

        if can_delete_all_pvcs(chi, host) {
            record(self.delete_tables(chi, host).await);
        }

        record(self.delete_stateful_set_object(&host.address.namespace, &sts_name).await);
        record(self.delete_host_pvcs(host).await);
        record(
            self.delete_config_map_if_exists(
                &host.address.namespace,
                &names::host_config_map_name(&host.address),
            )
            .await,
        );
        record(
            self.delete_service_if_exists(
                &host.address.namespace,
                &names::host_service_name(&host.address),
            )
            .await,
        );

        // The installation itself may already be unavailable at this point,
        // so the status write is tolerant.
        status.deleted_hosts_count += 1;
        let _ = self.update_chi_status(chi, status, true).await;

        match first_error {
            Some(err) => {
                self.announcer
                    .event(
                        chi,
                        EventAction::Delete,
                        EventReason::Failed,
                        format!("deletion of host {} failed: {}", host.address.short(), err),
                    )
                    .await;
                Err(err)
            }
            None => {
                self.announcer
                    .event(
                        chi,
                        EventAction::Delete,
                        EventReason::Completed,
                        format!("deleted host {}", host.address.short()),
                    )
                    .await;
                Ok(())
            }
        }
    }

    async fn delete_tables(&self, chi: &NormalizedChi, host: &NormalizedHost) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        match self.schemer.host_delete_tables(host).await {
            Ok(()) => {
                self.announcer
                    .event(
                        chi,
                        EventAction::Delete,
                        EventReason::Completed,
                        format!("dropped tables on host {}", host.address.short()),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.announcer
                    .event(
                        chi,
                        EventAction::Delete,
                        EventReason::Failed,
                        format!("dropping tables on host {} failed: {}", host.address.short(), err),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn delete_host_pvcs(&self, host: &NormalizedHost) -> Result<()> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &host.address.namespace);

        let mut first_error: Option<Error> = None;
        for template in host.volume_claim_templates() {
            let pvc_name = names::pvc_name(&template.name, &host.address);
            match api.delete(&pvc_name, &DeleteParams::default()).await {
                Ok(_) => debug!("deleted PVC {}", pvc_name),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(err) => {
                    warn!("unable to delete PVC {}: {}", pvc_name, err);
                    first_error.get_or_insert(Error::KubeError(err));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_service_if_exists(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!("deleted Service {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    async fn delete_config_map_if_exists(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!("deleted ConfigMap {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    // ========================================================================
    // DropDNS, watch set, status
    // ========================================================================

    /// An endpoint changed: resolve the owning installation from the
    /// initiator's labels and flush DNS caches fleet-wide. Errors are logged
    /// and swallowed.
    async fn drop_dns(&self, initiator: &ObjectMeta) {
        let Some(chi_name) = labels::chi_name_from_labels(initiator.labels.as_ref()) else {
            error!(
                "unable to resolve an installation from {:?}/{:?} labels {:?}",
                initiator.namespace, initiator.name, initiator.labels
            );
            return;
        };
        let namespace = initiator
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        match self.chi_by_name(&namespace, &chi_name).await {
            Ok(chi) => {
                debug!(
                    "endpoint {:?}/{:?} changed, flushing DNS for installation {}",
                    initiator.namespace, initiator.name, chi.name
                );
                if let Err(err) = self.schemer.chi_drop_dns_cache(&chi).await {
                    warn!("DNS cache flush for {} failed: {}", chi.name, err);
                }
            }
            Err(err) => error!(
                "unable to load installation {}/{}: {}",
                namespace, chi_name, err
            ),
        }
    }

    async fn chi_by_name(&self, namespace: &str, name: &str) -> Result<NormalizedChi> {
        let api: Api<ClickHouseInstallation> = Api::namespaced(self.client.clone(), namespace);
        let chi = api.get(name).await?;
        self.normalizer.normalize(&chi, true)
    }

    fn update_watch(&self, chi: &NormalizedChi) {
        self.watched
            .lock()
            .expect("watch set poisoned")
            .insert((chi.namespace.clone(), chi.name.clone()), chi.fqdns());
    }

    fn delete_watch(&self, namespace: &str, name: &str) {
        self.watched
            .lock()
            .expect("watch set poisoned")
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Patch the installation's status subresource. With `tolerant` set,
    /// failures are logged and reported as success.
    async fn update_chi_status(
        &self,
        chi: &NormalizedChi,
        status: &ChiStatus,
        tolerant: bool,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let api: Api<ClickHouseInstallation> =
            Api::namespaced(self.client.clone(), &chi.namespace);
        let patch = serde_json::json!({ "status": status });
        match api
            .patch_status(&chi.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if tolerant => {
                warn!("tolerated status write failure for {}: {}", chi.name, err);
                Ok(())
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }
}

// ============================================================================
// Pure decision helpers
// ============================================================================

/// Build the per-host attribute table from the action plan.
fn stamp_attributes(plan: &ActionPlan, chi: &NormalizedChi, update: bool) -> HostAttributeMap {
    let mut attributes = HostAttributeMap::default();

    // One walk per level: hosts of added clusters and shards are marked
    // through their parent, individually added hosts directly.
    plan.walk_added(
        |cluster| {
            for shard in &cluster.shards {
                for host in &shard.hosts {
                    attributes.update(&host.address, |a| a.add = true);
                }
            }
        },
        |_| {},
        |_| {},
    );
    plan.walk_added(
        |_| {},
        |shard| {
            for host in &shard.hosts {
                attributes.update(&host.address, |a| a.add = true);
            }
        },
        |_| {},
    );
    plan.walk_added(
        |_| {},
        |_| {},
        |host| attributes.update(&host.address, |a| a.add = true),
    );

    plan.walk_modified(
        |_| {},
        |_| {},
        |host| attributes.update(&host.address, |a| a.modify = true),
    );

    for host in chi.hosts() {
        if update {
            // Schemas may need migrating even on untouched hosts.
            attributes.update(&host.address, |a| a.migrate = true);
        }
        let attrs = attributes.get(&host.address);
        if !attrs.add && !attrs.modify {
            // The workload may have drifted even though the spec is equal;
            // force a defensive visit.
            attributes.update(&host.address, |a| a.unclear = true);
        }
    }

    attributes
}

/// Whether host mutation must wait for the host to leave the topology first.
fn should_wait_exclude_host(
    config: &OperatorConfig,
    chi: &NormalizedChi,
    host: &NormalizedHost,
    status: StatefulSetStatus,
) -> bool {
    if matches!(status, StatefulSetStatus::New | StatefulSetStatus::Same) {
        // Nothing is changing, or the workload is being created fresh.
        return false;
    }

    if chi
        .shard_of(&host.address)
        .map(|shard| shard.hosts_count())
        .unwrap_or(0)
        <= 1
    {
        // A single-replica shard has no peer to take the traffic.
        return false;
    }

    if chi.reconciling.is_wait() {
        return true;
    }
    if chi.reconciling.is_no_wait() {
        return false;
    }

    config.reconcile_wait_exclude
}

/// Symmetric to exclusion, keyed on the include wait setting.
fn should_wait_include_host(
    config: &OperatorConfig,
    chi: &NormalizedChi,
    host: &NormalizedHost,
    status: StatefulSetStatus,
) -> bool {
    if matches!(status, StatefulSetStatus::New | StatefulSetStatus::Same) {
        return false;
    }

    if chi
        .shard_of(&host.address)
        .map(|shard| shard.hosts_count())
        .unwrap_or(0)
        <= 1
    {
        return false;
    }

    if chi.reconciling.is_wait() {
        return true;
    }
    if chi.reconciling.is_no_wait() {
        return false;
    }

    config.reconcile_wait_include
}

/// Classify an existing StatefulSet against the desired one.
fn classify_stateful_set(
    current: Option<&StatefulSet>,
    desired: &StatefulSet,
) -> StatefulSetStatus {
    let Some(current) = current else {
        return StatefulSetStatus::New;
    };

    let current_version = current
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_STATEFULSET_VERSION));
    let desired_version = desired
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_STATEFULSET_VERSION));
    if let (Some(current_version), Some(desired_version)) = (current_version, desired_version) {
        if current_version == desired_version {
            return StatefulSetStatus::Same;
        }
    }

    let current_spec = serde_json::to_value(&current.spec).unwrap_or_default();
    let desired_spec = serde_json::to_value(&desired.spec).unwrap_or_default();
    if current_spec != desired_spec {
        StatefulSetStatus::Modified
    } else {
        StatefulSetStatus::Unknown
    }
}

/// Carry platform-assigned Service fields over to the desired object so an
/// in-place update does not clobber them.
fn merge_service_for_update(desired: &mut Service, current: &Service) {
    desired.metadata.resource_version = current.metadata.resource_version.clone();

    let current_spec = current.spec.clone().unwrap_or_default();
    let spec = desired.spec.get_or_insert_with(Default::default);

    // Auto-assigned node ports cannot be changed while the service type
    // keeps requiring them: reuse the whole current port entry.
    let keeps_node_ports = matches!(
        (current_spec.type_.as_deref(), spec.type_.as_deref()),
        (Some("NodePort"), Some("NodePort")) | (Some("LoadBalancer"), Some("LoadBalancer"))
    );
    if keeps_node_ports {
        if let (Some(ports), Some(current_ports)) = (spec.ports.as_mut(), current_spec.ports.as_ref())
        {
            for port in ports.iter_mut() {
                if let Some(current_port) =
                    current_ports.iter().find(|p| p.port == port.port)
                {
                    *port = current_port.clone();
                }
            }
        }
    }

    // clusterIP is immutable.
    spec.cluster_ip = current_spec.cluster_ip.clone();

    // healthCheckNodePort is immutable while both sides keep Local traffic
    // policy.
    if current_spec.external_traffic_policy.as_deref() == Some("Local")
        && spec.external_traffic_policy.as_deref() == Some("Local")
    {
        spec.health_check_node_port = current_spec.health_check_node_port;
    }

    merge_string_maps(&mut desired.metadata.labels, current.metadata.labels.as_ref());
    merge_string_maps(
        &mut desired.metadata.annotations,
        current.metadata.annotations.as_ref(),
    );
    if let Some(current_finalizers) = &current.metadata.finalizers {
        let finalizers = desired.metadata.finalizers.get_or_insert_with(Vec::new);
        for finalizer in current_finalizers {
            if !finalizers.contains(finalizer) {
                finalizers.push(finalizer.clone());
            }
        }
    }
}

/// Fold `source` entries into `target`, keeping target values on collision.
fn merge_string_maps(
    target: &mut Option<BTreeMap<String, String>>,
    source: Option<&BTreeMap<String, String>>,
) {
    let Some(source) = source else { return };
    let target = target.get_or_insert_with(Default::default);
    for (key, value) in source {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Converge current PVC requests toward the desired ones. Only resource
/// names present on both sides are updated; returns `None` when nothing
/// changes.
fn merged_resource_requests(
    current: Option<&BTreeMap<String, Quantity>>,
    desired: Option<&BTreeMap<String, Quantity>>,
) -> Option<BTreeMap<String, Quantity>> {
    let (current, desired) = (current?, desired?);

    let mut merged = current.clone();
    let mut changed = false;
    for (name, desired_quantity) in desired {
        if let Some(current_quantity) = merged.get_mut(name) {
            if current_quantity != desired_quantity {
                *current_quantity = desired_quantity.clone();
                changed = true;
            }
        }
    }

    changed.then_some(merged)
}

/// Whether all of the host's claims may be discarded on deletion
fn can_delete_all_pvcs(chi: &NormalizedChi, host: &NormalizedHost) -> bool {
    host.volume_claim_templates().iter().all(|template| {
        template
            .reclaim_policy
            .unwrap_or(chi.defaults.storage_management)
            .is_delete()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PvcReclaimPolicy, ReconcilingPolicy, VolumeClaimTemplate};
    use crate::model::{ClusterAddress, HostAddress, ResolvedTemplates, ShardAddress};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    fn host(shard: usize, replica: usize) -> NormalizedHost {
        NormalizedHost {
            address: HostAddress {
                namespace: "ns".to_string(),
                chi_name: "c1".to_string(),
                cluster_index: 0,
                cluster_name: "events".to_string(),
                shard_index: shard,
                shard_name: shard.to_string(),
                replica_index: replica,
                host_name: format!("chi-c1-events-{}-{}", shard, replica),
            },
            tcp_port: 9000,
            http_port: 8123,
            interserver_http_port: 9009,
            templates: ResolvedTemplates::default(),
        }
    }

    fn chi_with_hosts(hosts_per_shard: usize) -> NormalizedChi {
        let hosts: Vec<NormalizedHost> = (0..hosts_per_shard).map(|r| host(0, r)).collect();
        NormalizedChi {
            namespace: "ns".to_string(),
            name: "c1".to_string(),
            uid: None,
            resource_version: None,
            deletion_scheduled: false,
            finalizers: vec![],
            stop: false,
            reconciling: ReconcilingPolicy::Unspecified,
            defaults: Default::default(),
            zookeeper: None,
            users: Default::default(),
            profiles: Default::default(),
            quotas: Default::default(),
            settings: Default::default(),
            templates: Default::default(),
            clusters: vec![crate::model::NormalizedCluster {
                address: ClusterAddress {
                    namespace: "ns".to_string(),
                    chi_name: "c1".to_string(),
                    cluster_name: "events".to_string(),
                    cluster_index: 0,
                },
                shards: vec![crate::model::NormalizedShard {
                    address: ShardAddress {
                        namespace: "ns".to_string(),
                        chi_name: "c1".to_string(),
                        cluster_name: "events".to_string(),
                        cluster_index: 0,
                        shard_name: "0".to_string(),
                        shard_index: 0,
                    },
                    weight: 1,
                    internal_replication: true,
                    hosts,
                }],
            }],
        }
    }

    fn wait_config() -> OperatorConfig {
        OperatorConfig {
            reconcile_wait_exclude: true,
            reconcile_wait_include: true,
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------------
    // Exclude / include decisions
    // ------------------------------------------------------------------------

    #[test]
    fn test_no_wait_for_new_or_unchanged_workloads() {
        let chi = chi_with_hosts(2);
        let config = wait_config();
        for status in [StatefulSetStatus::New, StatefulSetStatus::Same] {
            assert!(!should_wait_exclude_host(&config, &chi, &host(0, 0), status));
            assert!(!should_wait_include_host(&config, &chi, &host(0, 0), status));
        }
    }

    #[test]
    fn test_single_replica_shard_never_waits() {
        let chi = chi_with_hosts(1);
        let config = wait_config();
        assert!(!should_wait_exclude_host(
            &config,
            &chi,
            &host(0, 0),
            StatefulSetStatus::Modified
        ));
    }

    #[test]
    fn test_wait_policy_forces_the_wait() {
        let mut chi = chi_with_hosts(2);
        chi.reconciling = ReconcilingPolicy::Wait;
        let config = OperatorConfig::default(); // operator-level waits disabled
        assert!(should_wait_exclude_host(
            &config,
            &chi,
            &host(0, 0),
            StatefulSetStatus::Modified
        ));
    }

    #[test]
    fn test_no_wait_policy_suppresses_the_wait() {
        let mut chi = chi_with_hosts(2);
        chi.reconciling = ReconcilingPolicy::NoWait;
        let config = wait_config();
        assert!(!should_wait_exclude_host(
            &config,
            &chi,
            &host(0, 0),
            StatefulSetStatus::Modified
        ));
        assert!(!should_wait_include_host(
            &config,
            &chi,
            &host(0, 0),
            StatefulSetStatus::Modified
        ));
    }

    #[test]
    fn test_unspecified_policy_defers_to_operator_config() {
        let chi = chi_with_hosts(2);
        assert!(!should_wait_exclude_host(
            &OperatorConfig::default(),
            &chi,
            &host(0, 0),
            StatefulSetStatus::Modified
        ));
        assert!(should_wait_exclude_host(
            &wait_config(),
            &chi,
            &host(0, 0),
            StatefulSetStatus::Modified
        ));
    }

    // ------------------------------------------------------------------------
    // Attribute stamping
    // ------------------------------------------------------------------------

    fn plan(old: Option<&NormalizedChi>, new: &NormalizedChi) -> ActionPlan {
        ActionPlan::new(
            old.map(|c| Arc::new(c.clone())),
            Arc::new(new.clone()),
        )
    }

    #[test]
    fn test_added_hosts_are_marked_add_and_migrate_on_update() {
        let old = chi_with_hosts(2);
        let new = chi_with_hosts(3);
        let attributes = stamp_attributes(&plan(Some(&old), &new), &new, true);

        let added = attributes.get(&host(0, 2).address);
        assert!(added.add);
        assert!(added.migrate);
        assert!(!added.unclear);

        // Untouched hosts still get a defensive visit plus migration.
        let kept = attributes.get(&host(0, 0).address);
        assert!(!kept.add);
        assert!(kept.unclear);
        assert!(kept.migrate);
    }

    #[test]
    fn test_first_reconcile_marks_all_hosts_add_without_migrate() {
        let new = chi_with_hosts(2);
        let attributes = stamp_attributes(&plan(None, &new), &new, false);
        for replica in 0..2 {
            let attrs = attributes.get(&host(0, replica).address);
            assert!(attrs.add);
            assert!(!attrs.migrate);
            assert!(!attrs.unclear);
        }
    }

    // ------------------------------------------------------------------------
    // StatefulSet classification
    // ------------------------------------------------------------------------

    fn stateful_set(version: Option<&str>, replicas: i32) -> StatefulSet {
        let mut sts = StatefulSet {
            spec: Some(k8s_openapi::api::apps::v1::StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        };
        if let Some(version) = version {
            sts.metadata.labels = Some(
                [(LABEL_STATEFULSET_VERSION.to_string(), version.to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        sts
    }

    #[test]
    fn test_absent_stateful_set_is_new() {
        assert_eq!(
            classify_stateful_set(None, &stateful_set(Some("v1"), 1)),
            StatefulSetStatus::New
        );
    }

    #[test]
    fn test_matching_version_labels_mean_same() {
        assert_eq!(
            classify_stateful_set(
                Some(&stateful_set(Some("v1"), 1)),
                &stateful_set(Some("v1"), 1)
            ),
            StatefulSetStatus::Same
        );
    }

    #[test]
    fn test_spec_difference_means_modified() {
        assert_eq!(
            classify_stateful_set(
                Some(&stateful_set(Some("v1"), 1)),
                &stateful_set(Some("v2"), 0)
            ),
            StatefulSetStatus::Modified
        );
    }

    #[test]
    fn test_equal_specs_without_matching_labels_are_unknown() {
        assert_eq!(
            classify_stateful_set(Some(&stateful_set(None, 1)), &stateful_set(None, 1)),
            StatefulSetStatus::Unknown
        );
    }

    // ------------------------------------------------------------------------
    // Service merge
    // ------------------------------------------------------------------------

    fn service(type_: &str, ports: Vec<ServicePort>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_cluster_ip_is_preserved_across_update() {
        let mut current = service("ClusterIP", vec![]);
        current.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".to_string());
        current.metadata.resource_version = Some("42".to_string());

        let mut desired = service("ClusterIP", vec![]);
        merge_service_for_update(&mut desired, &current);

        let spec = desired.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(desired.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn test_node_ports_are_reused_for_matching_port_numbers() {
        let current = service(
            "NodePort",
            vec![ServicePort {
                port: 8123,
                node_port: Some(31234),
                ..Default::default()
            }],
        );
        let mut desired = service(
            "NodePort",
            vec![
                ServicePort {
                    port: 8123,
                    ..Default::default()
                },
                ServicePort {
                    port: 9000,
                    ..Default::default()
                },
            ],
        );

        merge_service_for_update(&mut desired, &current);
        let ports = desired.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].node_port, Some(31234));
        assert_eq!(ports[1].node_port, None);
    }

    #[test]
    fn test_node_ports_not_reused_across_type_change() {
        let current = service(
            "NodePort",
            vec![ServicePort {
                port: 8123,
                node_port: Some(31234),
                ..Default::default()
            }],
        );
        let mut desired = service(
            "ClusterIP",
            vec![ServicePort {
                port: 8123,
                ..Default::default()
            }],
        );

        merge_service_for_update(&mut desired, &current);
        assert_eq!(desired.spec.unwrap().ports.unwrap()[0].node_port, None);
    }

    #[test]
    fn test_health_check_node_port_kept_while_both_local() {
        let mut current = service("LoadBalancer", vec![]);
        {
            let spec = current.spec.as_mut().unwrap();
            spec.external_traffic_policy = Some("Local".to_string());
            spec.health_check_node_port = Some(32000);
        }
        let mut desired = service("LoadBalancer", vec![]);
        desired.spec.as_mut().unwrap().external_traffic_policy = Some("Local".to_string());

        merge_service_for_update(&mut desired, &current);
        assert_eq!(desired.spec.unwrap().health_check_node_port, Some(32000));
    }

    #[test]
    fn test_labels_merge_keeps_desired_values_and_current_extras() {
        let mut current = service("ClusterIP", vec![]);
        current.metadata.labels = Some(
            [
                ("shared".to_string(), "current".to_string()),
                ("only-current".to_string(), "kept".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        current.metadata.finalizers = Some(vec!["service.kubernetes.io/lb".to_string()]);

        let mut desired = service("ClusterIP", vec![]);
        desired.metadata.labels = Some(
            [("shared".to_string(), "desired".to_string())]
                .into_iter()
                .collect(),
        );

        merge_service_for_update(&mut desired, &current);
        let labels = desired.metadata.labels.unwrap();
        assert_eq!(labels.get("shared").map(String::as_str), Some("desired"));
        assert_eq!(labels.get("only-current").map(String::as_str), Some("kept"));
        assert_eq!(
            desired.metadata.finalizers.unwrap(),
            vec!["service.kubernetes.io/lb".to_string()]
        );
    }

    // ------------------------------------------------------------------------
    // PVC request convergence
    // ------------------------------------------------------------------------

    fn requests(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[test]
    fn test_only_shared_resource_names_are_updated() {
        let current = requests(&[("storage", "100Gi"), ("current-only", "1")]);
        let desired = requests(&[("storage", "200Gi"), ("desired-only", "2")]);

        let merged = merged_resource_requests(Some(&current), Some(&desired)).unwrap();
        assert_eq!(merged["storage"], Quantity("200Gi".to_string()));
        // Names on only one side are ignored in both directions.
        assert_eq!(merged["current-only"], Quantity("1".to_string()));
        assert!(!merged.contains_key("desired-only"));
    }

    #[test]
    fn test_equal_requests_produce_no_update() {
        let current = requests(&[("storage", "100Gi")]);
        let desired = requests(&[("storage", "100Gi")]);
        assert!(merged_resource_requests(Some(&current), Some(&desired)).is_none());
    }

    #[test]
    fn test_missing_side_produces_no_update() {
        let current = requests(&[("storage", "100Gi")]);
        assert!(merged_resource_requests(Some(&current), None).is_none());
        assert!(merged_resource_requests(None, Some(&current)).is_none());
    }

    // ------------------------------------------------------------------------
    // PVC reclaim gating
    // ------------------------------------------------------------------------

    fn host_with_claims(policies: Vec<Option<PvcReclaimPolicy>>) -> NormalizedHost {
        let mut host = host(0, 0);
        let mut iter = policies.into_iter();
        host.templates.data_volume_claim = iter.next().flatten().map(|p| VolumeClaimTemplate {
            name: "data".to_string(),
            reclaim_policy: Some(p),
            ..Default::default()
        });
        host.templates.log_volume_claim = iter.next().flatten().map(|p| VolumeClaimTemplate {
            name: "log".to_string(),
            reclaim_policy: Some(p),
            ..Default::default()
        });
        host
    }

    #[test]
    fn test_retain_policy_blocks_pvc_deletion() {
        let chi = chi_with_hosts(1);
        let host = host_with_claims(vec![
            Some(PvcReclaimPolicy::Delete),
            Some(PvcReclaimPolicy::Retain),
        ]);
        assert!(!can_delete_all_pvcs(&chi, &host));
    }

    #[test]
    fn test_template_policy_falls_back_to_installation_default() {
        let mut chi = chi_with_hosts(1);
        chi.defaults.storage_management = PvcReclaimPolicy::Retain;

        let mut host = host(0, 0);
        host.templates.data_volume_claim = Some(VolumeClaimTemplate {
            name: "data".to_string(),
            reclaim_policy: None,
            ..Default::default()
        });
        assert!(!can_delete_all_pvcs(&chi, &host));

        chi.defaults.storage_management = PvcReclaimPolicy::Delete;
        assert!(can_delete_all_pvcs(&chi, &host));
    }
}
