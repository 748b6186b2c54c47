//! Normalization of raw installations into the canonical model
//!
//! Normalization is a pure function of the installation, the registered
//! installation templates and the defaulting rules: counts become explicit
//! shard/host lists, template references resolve to template bodies, every
//! node receives its address. Running it twice changes nothing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kube::ResourceExt;
use tracing::warn;

use crate::crd::{
    ChiClusterSpec, ChiReplicaSpec, ChiShardSpec, ChiSpec, ClickHouseInstallation,
    ClickHouseInstallationTemplate, TemplateRefs,
};
use crate::error::{Error, Result};

use super::names;
use super::normalized::{
    ClusterAddress, HostAddress, NormalizedChi, NormalizedCluster, NormalizedHost,
    NormalizedShard, ResolvedTemplates, ShardAddress,
};

const DEFAULT_CLUSTER_NAME: &str = "cluster";
const DEFAULT_TCP_PORT: u16 = 9000;
const DEFAULT_HTTP_PORT: u16 = 8123;
const DEFAULT_INTERSERVER_HTTP_PORT: u16 = 9009;

/// Normalizes installations, resolving registered installation templates.
#[derive(Clone, Default)]
pub struct Normalizer {
    templates: Arc<RwLock<HashMap<(String, String), ChiSpec>>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an installation template.
    pub fn register_template(&self, template: &ClickHouseInstallationTemplate) {
        let key = (
            template.namespace().unwrap_or_else(|| "default".to_string()),
            template.name_any(),
        );
        self.templates
            .write()
            .expect("template registry poisoned")
            .insert(key, template.spec.template.clone());
    }

    pub fn unregister_template(&self, template: &ClickHouseInstallationTemplate) {
        let key = (
            template.namespace().unwrap_or_else(|| "default".to_string()),
            template.name_any(),
        );
        self.templates
            .write()
            .expect("template registry poisoned")
            .remove(&key);
    }

    /// Normalize an installation.
    ///
    /// `with_default_cluster` controls whether an installation without any
    /// declared cluster receives the implicit single default cluster.
    pub fn normalize(
        &self,
        chi: &ClickHouseInstallation,
        with_default_cluster: bool,
    ) -> Result<NormalizedChi> {
        chi.spec.validate().map_err(Error::ValidationError)?;

        let namespace = chi.namespace().unwrap_or_else(|| "default".to_string());
        let name = chi.name_any();

        let mut spec = chi.spec.clone();
        self.apply_use_templates(&namespace, &mut spec);

        if spec.configuration.clusters.is_empty() && with_default_cluster {
            spec.configuration.clusters.push(ChiClusterSpec {
                name: DEFAULT_CLUSTER_NAME.to_string(),
                ..Default::default()
            });
        }

        let mut clusters = Vec::with_capacity(spec.configuration.clusters.len());
        for (cluster_index, cluster_spec) in spec.configuration.clusters.iter().enumerate() {
            clusters.push(self.normalize_cluster(
                &namespace,
                &name,
                &spec,
                cluster_index,
                cluster_spec,
            ));
        }

        Ok(NormalizedChi {
            namespace,
            name,
            uid: chi.metadata.uid.clone(),
            resource_version: chi.metadata.resource_version.clone(),
            deletion_scheduled: chi.metadata.deletion_timestamp.is_some(),
            finalizers: chi.metadata.finalizers.clone().unwrap_or_default(),
            stop: spec.stop,
            reconciling: spec.reconciling,
            defaults: spec.defaults.clone(),
            zookeeper: spec.configuration.zookeeper.clone(),
            users: spec.configuration.users.clone(),
            profiles: spec.configuration.profiles.clone(),
            quotas: spec.configuration.quotas.clone(),
            settings: spec.configuration.settings.clone(),
            templates: spec.templates.clone(),
            clusters,
        })
    }

    /// Merge referenced installation templates under the installation's own
    /// spec. The installation wins wherever both define a value.
    fn apply_use_templates(&self, namespace: &str, spec: &mut ChiSpec) {
        if spec.use_templates.is_empty() {
            return;
        }

        let registry = self.templates.read().expect("template registry poisoned");
        for reference in spec.use_templates.clone() {
            let key = (
                reference.namespace.clone().unwrap_or_else(|| namespace.to_string()),
                reference.name.clone(),
            );
            let Some(template) = registry.get(&key) else {
                warn!(
                    "installation template {}/{} is not registered, skipping",
                    key.0, key.1
                );
                continue;
            };

            let mut merged_templates = template.templates.clone();
            merged_templates.merge(&spec.templates);
            spec.templates = merged_templates;

            if spec.configuration.zookeeper.is_none() {
                spec.configuration.zookeeper = template.configuration.zookeeper.clone();
            }
            for (key, value) in &template.configuration.users {
                spec.configuration.users.entry(key.clone()).or_insert_with(|| value.clone());
            }
            for (key, value) in &template.configuration.profiles {
                spec.configuration
                    .profiles
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            for (key, value) in &template.configuration.settings {
                spec.configuration
                    .settings
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            if let Some(template_refs) = &template.defaults.templates {
                let own = spec.defaults.templates.clone().unwrap_or_default();
                spec.defaults.templates = Some(template_refs.merged_with(&own));
            }
        }
    }

    fn normalize_cluster(
        &self,
        namespace: &str,
        chi_name: &str,
        spec: &ChiSpec,
        cluster_index: usize,
        cluster: &ChiClusterSpec,
    ) -> NormalizedCluster {
        let address = ClusterAddress {
            namespace: namespace.to_string(),
            chi_name: chi_name.to_string(),
            cluster_name: cluster.name.clone(),
            cluster_index,
        };

        let shards_count = cluster
            .layout
            .shards_count
            .map(|c| c as usize)
            .unwrap_or_else(|| cluster.layout.shards.len().max(1));

        let mut shards = Vec::with_capacity(shards_count);
        for shard_index in 0..shards_count {
            let shard_spec = cluster.layout.shards.get(shard_index).cloned().unwrap_or_default();
            shards.push(self.normalize_shard(
                &address,
                spec,
                cluster,
                shard_index,
                &shard_spec,
            ));
        }

        NormalizedCluster { address, shards }
    }

    fn normalize_shard(
        &self,
        cluster_address: &ClusterAddress,
        spec: &ChiSpec,
        cluster: &ChiClusterSpec,
        shard_index: usize,
        shard: &ChiShardSpec,
    ) -> NormalizedShard {
        let shard_name = shard
            .name
            .clone()
            .unwrap_or_else(|| shard_index.to_string());
        let address = ShardAddress {
            namespace: cluster_address.namespace.clone(),
            chi_name: cluster_address.chi_name.clone(),
            cluster_name: cluster_address.cluster_name.clone(),
            cluster_index: cluster_address.cluster_index,
            shard_name,
            shard_index,
        };

        let replicas_count = shard
            .replicas_count
            .or(cluster.layout.replicas_count)
            .map(|c| c as usize)
            .unwrap_or_else(|| shard.replicas.len().max(1));

        let mut hosts = Vec::with_capacity(replicas_count);
        for replica_index in 0..replicas_count {
            let replica_spec = shard.replicas.get(replica_index).cloned().unwrap_or_default();
            hosts.push(self.normalize_host(
                &address,
                spec,
                cluster,
                shard,
                replica_index,
                &replica_spec,
            ));
        }

        NormalizedShard {
            address,
            weight: shard.weight.unwrap_or(1),
            internal_replication: shard.internal_replication.unwrap_or(true),
            hosts,
        }
    }

    fn normalize_host(
        &self,
        shard_address: &ShardAddress,
        spec: &ChiSpec,
        cluster: &ChiClusterSpec,
        shard: &ChiShardSpec,
        replica_index: usize,
        replica: &ChiReplicaSpec,
    ) -> NormalizedHost {
        let mut address = HostAddress {
            namespace: shard_address.namespace.clone(),
            chi_name: shard_address.chi_name.clone(),
            cluster_index: shard_address.cluster_index,
            cluster_name: shard_address.cluster_name.clone(),
            shard_index: shard_address.shard_index,
            shard_name: shard_address.shard_name.clone(),
            replica_index,
            host_name: String::new(),
        };
        address.host_name = replica
            .name
            .clone()
            .unwrap_or_else(|| names::host_base_name(&address));

        let refs = effective_template_refs(spec, cluster, shard, replica);
        let templates = ResolvedTemplates {
            pod: refs
                .pod_template
                .as_deref()
                .and_then(|name| lookup(spec, "podTemplate", name, |t| t.pod_template(name).cloned())),
            data_volume_claim: refs.data_volume_claim_template.as_deref().and_then(|name| {
                lookup(spec, "volumeClaimTemplate", name, |t| {
                    t.volume_claim_template(name).cloned()
                })
            }),
            log_volume_claim: refs.log_volume_claim_template.as_deref().and_then(|name| {
                lookup(spec, "volumeClaimTemplate", name, |t| {
                    t.volume_claim_template(name).cloned()
                })
            }),
            service: refs.service_template.as_deref().and_then(|name| {
                lookup(spec, "serviceTemplate", name, |t| t.service_template(name).cloned())
            }),
        };

        NormalizedHost {
            address,
            tcp_port: replica.tcp_port.unwrap_or(DEFAULT_TCP_PORT),
            http_port: replica.http_port.unwrap_or(DEFAULT_HTTP_PORT),
            interserver_http_port: replica
                .interserver_http_port
                .unwrap_or(DEFAULT_INTERSERVER_HTTP_PORT),
            templates,
        }
    }
}

fn effective_template_refs(
    spec: &ChiSpec,
    cluster: &ChiClusterSpec,
    shard: &ChiShardSpec,
    replica: &ChiReplicaSpec,
) -> TemplateRefs {
    let mut refs = spec.defaults.templates.clone().unwrap_or_default();
    if let Some(cluster_refs) = &cluster.templates {
        refs = refs.merged_with(cluster_refs);
    }
    if let Some(shard_refs) = &shard.templates {
        refs = refs.merged_with(shard_refs);
    }
    if let Some(replica_refs) = &replica.templates {
        refs = refs.merged_with(replica_refs);
    }
    refs
}

fn lookup<T>(
    spec: &ChiSpec,
    kind: &str,
    name: &str,
    find: impl FnOnce(&crate::crd::ChiTemplates) -> Option<T>,
) -> Option<T> {
    let found = find(&spec.templates);
    if found.is_none() {
        warn!("{} {:?} referenced but not defined, ignoring", kind, name);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ChiClusterLayout, ChiConfiguration, UseTemplateRef};
    use kube::api::ObjectMeta;

    fn installation(spec: ChiSpec) -> ClickHouseInstallation {
        ClickHouseInstallation {
            metadata: ObjectMeta {
                name: Some("c1".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn counted_spec(shards: u32, replicas: u32) -> ChiSpec {
        ChiSpec {
            configuration: ChiConfiguration {
                clusters: vec![ChiClusterSpec {
                    name: "events".to_string(),
                    layout: ChiClusterLayout {
                        shards_count: Some(shards),
                        replicas_count: Some(replicas),
                        shards: vec![],
                    },
                    templates: None,
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_counts_expand_into_explicit_hosts() {
        let normalizer = Normalizer::new();
        let chi = normalizer
            .normalize(&installation(counted_spec(2, 3)), true)
            .unwrap();

        assert_eq!(chi.clusters_count(), 1);
        assert_eq!(chi.shards_count(), 2);
        assert_eq!(chi.hosts_count(), 6);
        let first = chi.hosts().next().unwrap();
        assert_eq!(first.address.host_name, "chi-c1-events-0-0");
        assert_eq!(first.tcp_port, 9000);
    }

    #[test]
    fn test_addresses_are_unique() {
        let normalizer = Normalizer::new();
        let chi = normalizer
            .normalize(&installation(counted_spec(3, 2)), true)
            .unwrap();

        let mut seen = std::collections::HashSet::new();
        for host in chi.hosts() {
            assert!(seen.insert(host.address.clone()), "duplicate {:?}", host.address);
        }
    }

    #[test]
    fn test_normalization_is_idempotent_across_forms() {
        // A compact, count-based layout and its fully explicit equivalent
        // normalize to the same tree.
        let normalizer = Normalizer::new();
        let compact = normalizer
            .normalize(&installation(counted_spec(2, 2)), true)
            .unwrap();

        let mut explicit = counted_spec(2, 2);
        {
            let layout = &mut explicit.configuration.clusters[0].layout;
            layout.shards = vec![
                ChiShardSpec {
                    name: Some("0".to_string()),
                    replicas: vec![ChiReplicaSpec::default(), ChiReplicaSpec::default()],
                    replicas_count: Some(2),
                    ..Default::default()
                },
                ChiShardSpec {
                    name: Some("1".to_string()),
                    replicas: vec![ChiReplicaSpec::default(), ChiReplicaSpec::default()],
                    replicas_count: Some(2),
                    ..Default::default()
                },
            ];
        }
        let expanded = normalizer.normalize(&installation(explicit), true).unwrap();

        assert_eq!(compact, expanded);
    }

    #[test]
    fn test_default_cluster_is_added_when_requested() {
        let normalizer = Normalizer::new();
        let chi = normalizer
            .normalize(&installation(ChiSpec::default()), true)
            .unwrap();
        assert_eq!(chi.clusters_count(), 1);
        assert_eq!(chi.clusters[0].address.cluster_name, "cluster");
        assert_eq!(chi.hosts_count(), 1);

        let bare = normalizer
            .normalize(&installation(ChiSpec::default()), false)
            .unwrap();
        assert_eq!(bare.clusters_count(), 0);
    }

    #[test]
    fn test_shard_level_replicas_count_overrides_cluster_level() {
        let mut spec = counted_spec(1, 3);
        spec.configuration.clusters[0].layout.shards = vec![ChiShardSpec {
            replicas_count: Some(1),
            ..Default::default()
        }];
        spec.configuration.clusters[0].layout.shards_count = Some(1);

        let normalizer = Normalizer::new();
        let chi = normalizer.normalize(&installation(spec), true).unwrap();
        assert_eq!(chi.hosts_count(), 1);
    }

    #[test]
    fn test_use_template_contributes_zookeeper_and_templates() {
        let normalizer = Normalizer::new();

        let template = ClickHouseInstallationTemplate {
            metadata: ObjectMeta {
                name: Some("base".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: crate::crd::ChiTemplateSpec {
                template: ChiSpec {
                    configuration: ChiConfiguration {
                        zookeeper: Some(crate::crd::ZookeeperConfig {
                            nodes: vec![crate::crd::ZookeeperNode {
                                host: "zk.zoo".to_string(),
                                port: None,
                            }],
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            },
        };
        normalizer.register_template(&template);

        let mut spec = counted_spec(1, 1);
        spec.use_templates = vec![UseTemplateRef {
            name: "base".to_string(),
            namespace: None,
        }];

        let chi = normalizer.normalize(&installation(spec), true).unwrap();
        assert_eq!(chi.zookeeper.as_ref().unwrap().nodes[0].host, "zk.zoo");

        normalizer.unregister_template(&template);
        let mut spec = counted_spec(1, 1);
        spec.use_templates = vec![UseTemplateRef {
            name: "base".to_string(),
            namespace: None,
        }];
        let chi = normalizer.normalize(&installation(spec), true).unwrap();
        assert!(chi.zookeeper.is_none());
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        let normalizer = Normalizer::new();
        let mut spec = counted_spec(1, 1);
        spec.configuration.clusters[0].name = String::new();
        assert!(normalizer.normalize(&installation(spec), true).is_err());
    }
}
