//! ClickHouseInstallation Custom Resource Definition
//!
//! A ClickHouseInstallation (CHI) declares a tree of clusters, shards and
//! replica hosts together with the templates used to materialize them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::ChiStatus;
use super::types::{
    ChiConfiguration, ChiDefaults, ChiTemplates, ReconcilingPolicy, UseTemplateRef,
};

/// The ClickHouseInstallation CRD declares a managed ClickHouse deployment.
///
/// # Example
///
/// ```yaml
/// apiVersion: clickhouse.example.com/v1
/// kind: ClickHouseInstallation
/// metadata:
///   name: analytics
///   namespace: databases
/// spec:
///   configuration:
///     zookeeper:
///       nodes:
///         - host: zookeeper.zoo.svc.cluster.local
///     clusters:
///       - name: events
///         layout:
///           shardsCount: 2
///           replicasCount: 2
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clickhouse.example.com",
    version = "v1",
    kind = "ClickHouseInstallation",
    namespaced,
    status = "ChiStatus",
    shortname = "chi",
    printcolumn = r#"{"name":"Clusters","type":"integer","jsonPath":".status.clustersCount"}"#,
    printcolumn = r#"{"name":"Hosts","type":"integer","jsonPath":".status.hostsCount"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChiSpec {
    /// Keep the declared objects but stop serving: the entry-point service
    /// is removed so no client traffic reaches the installation
    #[serde(default)]
    pub stop: bool,

    /// Per-installation override of the rolling-reconcile wait behavior
    #[serde(default)]
    pub reconciling: ReconcilingPolicy,

    /// Installation templates applied before this spec during normalization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub use_templates: Vec<UseTemplateRef>,

    /// Defaults inherited throughout the installation tree
    #[serde(default)]
    pub defaults: ChiDefaults,

    /// Topology and ClickHouse-side configuration
    #[serde(default)]
    pub configuration: ChiConfiguration,

    /// Reusable pod / volume claim / service templates
    #[serde(default)]
    pub templates: ChiTemplates,
}

/// ClickHouseInstallationTemplate carries the same spec shape as the
/// installation itself and is merged into installations that reference it.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clickhouse.example.com",
    version = "v1",
    kind = "ClickHouseInstallationTemplate",
    namespaced,
    shortname = "chit"
)]
#[serde(rename_all = "camelCase")]
pub struct ChiTemplateSpec {
    #[serde(flatten)]
    pub template: ChiSpec,
}

impl ChiSpec {
    /// Validate the spec before normalization.
    ///
    /// Checks structural consistency only; template references are resolved
    /// (and reported) by the normalizer, which also sees merged-in
    /// installation templates.
    pub fn validate(&self) -> Result<(), String> {
        let mut cluster_names = std::collections::HashSet::new();
        for cluster in &self.configuration.clusters {
            if cluster.name.trim().is_empty() {
                return Err("configuration.clusters[].name must not be empty".to_string());
            }
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(format!(
                    "configuration.clusters[].name {:?} is duplicated",
                    cluster.name
                ));
            }

            let layout = &cluster.layout;
            if let Some(count) = layout.shards_count {
                if count == 0 {
                    return Err("layout.shardsCount must be at least 1".to_string());
                }
                if !layout.shards.is_empty() && layout.shards.len() != count as usize {
                    return Err(format!(
                        "cluster {:?}: layout.shardsCount ({}) disagrees with layout.shards ({} entries)",
                        cluster.name,
                        count,
                        layout.shards.len()
                    ));
                }
            }
            if layout.replicas_count == Some(0) {
                return Err("layout.replicasCount must be at least 1".to_string());
            }

            let mut shard_names = std::collections::HashSet::new();
            for shard in &layout.shards {
                if let Some(name) = &shard.name {
                    if !shard_names.insert(name.as_str()) {
                        return Err(format!(
                            "cluster {:?}: shard name {:?} is duplicated",
                            cluster.name, name
                        ));
                    }
                }
                if let Some(count) = shard.replicas_count {
                    if count == 0 {
                        return Err("shard.replicasCount must be at least 1".to_string());
                    }
                    if !shard.replicas.is_empty() && shard.replicas.len() != count as usize {
                        return Err(format!(
                            "cluster {:?}: shard.replicasCount ({}) disagrees with shard.replicas ({} entries)",
                            cluster.name,
                            count,
                            shard.replicas.len()
                        ));
                    }
                }
                let mut replica_names = std::collections::HashSet::new();
                for replica in &shard.replicas {
                    if let Some(name) = &replica.name {
                        if !replica_names.insert(name.as_str()) {
                            return Err(format!(
                                "cluster {:?}: replica name {:?} is duplicated",
                                cluster.name, name
                            ));
                        }
                    }
                }
            }
        }

        let templates = &self.templates;
        let mut seen = std::collections::HashSet::new();
        for t in &templates.pod_templates {
            if !seen.insert(("pod", t.name.as_str())) {
                return Err(format!("templates.podTemplates name {:?} is duplicated", t.name));
            }
        }
        for t in &templates.volume_claim_templates {
            if !seen.insert(("vct", t.name.as_str())) {
                return Err(format!(
                    "templates.volumeClaimTemplates name {:?} is duplicated",
                    t.name
                ));
            }
        }
        for t in &templates.service_templates {
            if !seen.insert(("svc", t.name.as_str())) {
                return Err(format!(
                    "templates.serviceTemplates name {:?} is duplicated",
                    t.name
                ));
            }
        }

        Ok(())
    }
}
