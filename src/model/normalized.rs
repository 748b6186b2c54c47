//! Normalized desired-state model
//!
//! The normalizer turns a raw ClickHouseInstallation into this canonical
//! tree: every count expanded into explicit shards and hosts, every template
//! reference resolved, every node stamped with a stable address.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crd::{
    ChiDefaults, ChiPodTemplate, ChiServiceTemplate, ChiTemplates, ReconcilingPolicy,
    VolumeClaimTemplate, ZookeeperConfig,
};

/// Stable identity of a cluster within an installation
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterAddress {
    pub namespace: String,
    pub chi_name: String,
    pub cluster_name: String,
    pub cluster_index: usize,
}

/// Stable identity of a shard within a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardAddress {
    pub namespace: String,
    pub chi_name: String,
    pub cluster_name: String,
    pub cluster_index: usize,
    pub shard_name: String,
    pub shard_index: usize,
}

/// Stable identity of a host. Unique within an installation and usable as a
/// primary key for the lifetime of one reconcile pass.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddress {
    pub namespace: String,
    pub chi_name: String,
    pub cluster_index: usize,
    pub cluster_name: String,
    pub shard_index: usize,
    pub shard_name: String,
    pub replica_index: usize,
    /// Derived deterministically from the rest of the address
    pub host_name: String,
}

impl HostAddress {
    /// Compact rendition for log lines
    pub fn short(&self) -> String {
        format!(
            "{}/{}/{}-{}-{}",
            self.namespace, self.chi_name, self.cluster_name, self.shard_index, self.replica_index
        )
    }
}

impl std::fmt::Display for HostAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.host_name)
    }
}

/// Templates resolved for one host, most specific level winning
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedTemplates {
    pub pod: Option<ChiPodTemplate>,
    pub data_volume_claim: Option<VolumeClaimTemplate>,
    pub log_volume_claim: Option<VolumeClaimTemplate>,
    pub service: Option<ChiServiceTemplate>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedHost {
    pub address: HostAddress,
    pub tcp_port: u16,
    pub http_port: u16,
    pub interserver_http_port: u16,
    pub templates: ResolvedTemplates,
}

impl NormalizedHost {
    /// Volume claim templates this host mounts, data before log
    pub fn volume_claim_templates(&self) -> Vec<&VolumeClaimTemplate> {
        self.templates
            .data_volume_claim
            .iter()
            .chain(self.templates.log_volume_claim.iter())
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedShard {
    pub address: ShardAddress,
    pub weight: u32,
    pub internal_replication: bool,
    pub hosts: Vec<NormalizedHost>,
}

impl NormalizedShard {
    pub fn hosts_count(&self) -> usize {
        self.hosts.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedCluster {
    pub address: ClusterAddress,
    pub shards: Vec<NormalizedShard>,
}

impl NormalizedCluster {
    pub fn hosts_count(&self) -> usize {
        self.shards.iter().map(|s| s.hosts.len()).sum()
    }
}

/// Canonical form of an installation: metadata snapshot plus the fully
/// expanded cluster tree.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedChi {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub deletion_scheduled: bool,
    pub finalizers: Vec<String>,

    pub stop: bool,
    pub reconciling: ReconcilingPolicy,
    pub defaults: ChiDefaults,
    pub zookeeper: Option<ZookeeperConfig>,
    pub users: std::collections::BTreeMap<String, String>,
    pub profiles: std::collections::BTreeMap<String, String>,
    pub quotas: std::collections::BTreeMap<String, String>,
    pub settings: std::collections::BTreeMap<String, String>,
    pub templates: ChiTemplates,

    pub clusters: Vec<NormalizedCluster>,
}

impl NormalizedChi {
    pub fn is_stopped(&self) -> bool {
        self.stop
    }

    pub fn clusters_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn shards_count(&self) -> usize {
        self.clusters.iter().map(|c| c.shards.len()).sum()
    }

    pub fn hosts_count(&self) -> usize {
        self.clusters.iter().map(|c| c.hosts_count()).sum()
    }

    /// Every shard in declaration order
    pub fn shards(&self) -> impl Iterator<Item = &NormalizedShard> {
        self.clusters.iter().flat_map(|c| c.shards.iter())
    }

    /// Every host in declaration order: cluster, then shard, then replica
    pub fn hosts(&self) -> impl Iterator<Item = &NormalizedHost> {
        self.shards().flat_map(|s| s.hosts.iter())
    }

    pub fn find_cluster(&self, name: &str) -> Option<&NormalizedCluster> {
        self.clusters.iter().find(|c| c.address.cluster_name == name)
    }

    /// Shard a host belongs to
    pub fn shard_of(&self, host: &HostAddress) -> Option<&NormalizedShard> {
        self.shards().find(|s| {
            s.address.cluster_index == host.cluster_index && s.address.shard_index == host.shard_index
        })
    }

    /// Pod FQDNs of every host, in declaration order
    pub fn fqdns(&self) -> Vec<String> {
        self.hosts()
            .map(|h| super::names::host_pod_fqdn(&h.address))
            .collect()
    }
}

/// Per-host reconcile flags.
///
/// `add`, `modify` and `unclear` are stamped by the action planner; the host
/// reconciler clears `add` and sets `reconciled` as the host converges. Also
/// doubles as a mask when filtering hosts out of the generated topology.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileAttributes {
    pub add: bool,
    pub modify: bool,
    pub unclear: bool,
    pub migrate: bool,
    pub reconciled: bool,
}

impl ReconcileAttributes {
    pub fn add() -> Self {
        ReconcileAttributes {
            add: true,
            ..Default::default()
        }
    }

    /// True when any flag set in `mask` is also set on `self`
    pub fn intersects(&self, mask: &ReconcileAttributes) -> bool {
        (self.add && mask.add)
            || (self.modify && mask.modify)
            || (self.unclear && mask.unclear)
            || (self.migrate && mask.migrate)
            || (self.reconciled && mask.reconciled)
    }
}

/// Side table of reconcile attributes, keyed by host address and owned by
/// the reconcile pass. Hosts without an entry report default attributes.
#[derive(Clone, Debug, Default)]
pub struct HostAttributeMap {
    map: HashMap<HostAddress, ReconcileAttributes>,
}

impl HostAttributeMap {
    pub fn get(&self, address: &HostAddress) -> ReconcileAttributes {
        self.map.get(address).copied().unwrap_or_default()
    }

    pub fn update(
        &mut self,
        address: &HostAddress,
        mutate: impl FnOnce(&mut ReconcileAttributes),
    ) {
        mutate(self.map.entry(address.clone()).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(replica: usize) -> HostAddress {
        HostAddress {
            namespace: "ns".to_string(),
            chi_name: "c1".to_string(),
            cluster_index: 0,
            cluster_name: "events".to_string(),
            shard_index: 0,
            shard_name: "events-0".to_string(),
            replica_index: replica,
            host_name: format!("chi-c1-events-0-{}", replica),
        }
    }

    #[test]
    fn test_attributes_intersect_on_shared_flag() {
        let mask = ReconcileAttributes::add();
        let mut attrs = ReconcileAttributes::default();
        assert!(!attrs.intersects(&mask));

        attrs.add = true;
        attrs.migrate = true;
        assert!(attrs.intersects(&mask));
    }

    #[test]
    fn test_attributes_do_not_intersect_on_disjoint_flags() {
        let mask = ReconcileAttributes::add();
        let attrs = ReconcileAttributes {
            migrate: true,
            unclear: true,
            ..Default::default()
        };
        assert!(!attrs.intersects(&mask));
    }

    #[test]
    fn test_attribute_map_defaults_missing_hosts() {
        let map = HostAttributeMap::default();
        assert_eq!(map.get(&address(0)), ReconcileAttributes::default());
    }

    #[test]
    fn test_attribute_map_update_creates_entry() {
        let mut map = HostAttributeMap::default();
        map.update(&address(1), |a| a.add = true);
        assert!(map.get(&address(1)).add);
        assert!(!map.get(&address(0)).add);
    }
}
