//! Shared configuration types for the ClickHouseInstallation CRD

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PodSpec, ServiceSpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the reconciler treats hosts that need a rolling change.
///
/// `Wait` forces the exclude/include dance around every host mutation,
/// `NoWait` skips it, `Unspecified` defers to the operator configuration.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReconcilingPolicy {
    #[default]
    Unspecified,
    Wait,
    NoWait,
}

impl ReconcilingPolicy {
    pub fn is_wait(&self) -> bool {
        matches!(self, ReconcilingPolicy::Wait)
    }

    pub fn is_no_wait(&self) -> bool {
        matches!(self, ReconcilingPolicy::NoWait)
    }
}

/// What happens to a host's PersistentVolumeClaims when the host goes away
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PvcReclaimPolicy {
    Retain,
    #[default]
    Delete,
}

impl PvcReclaimPolicy {
    pub fn is_delete(&self) -> bool {
        matches!(self, PvcReclaimPolicy::Delete)
    }
}

/// Zookeeper ensemble the installation coordinates replication through
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperConfig {
    pub nodes: Vec<ZookeeperNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_timeout_ms: Option<u32>,
    /// Chroot path all installation znodes live under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperNode {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ZookeeperNode {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(2181)
    }
}

/// Installation-wide defaults inherited by every cluster, shard and host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiDefaults {
    /// Use fully-qualified pod DNS names in the generated topology
    #[serde(default)]
    pub replicas_use_fqdn: bool,
    /// Settings profile applied to distributed DDL queries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributed_ddl_profile: Option<String>,
    /// Default PVC reclaim behavior, overridable per volume claim template
    #[serde(default)]
    pub storage_management: PvcReclaimPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates: Option<TemplateRefs>,
}

/// Named references into [`ChiTemplates`], resolvable at any level of the
/// installation tree. More specific levels win.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_volume_claim_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_volume_claim_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_template: Option<String>,
}

impl TemplateRefs {
    /// Overlay `other` on top of `self`: fields set in `other` win.
    pub fn merged_with(&self, other: &TemplateRefs) -> TemplateRefs {
        TemplateRefs {
            pod_template: other.pod_template.clone().or_else(|| self.pod_template.clone()),
            data_volume_claim_template: other
                .data_volume_claim_template
                .clone()
                .or_else(|| self.data_volume_claim_template.clone()),
            log_volume_claim_template: other
                .log_volume_claim_template
                .clone()
                .or_else(|| self.log_volume_claim_template.clone()),
            service_template: other
                .service_template
                .clone()
                .or_else(|| self.service_template.clone()),
        }
    }
}

/// Reusable workload and service templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiTemplates {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_templates: Vec<ChiPodTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_templates: Vec<ChiServiceTemplate>,
}

impl ChiTemplates {
    pub fn is_empty(&self) -> bool {
        self.pod_templates.is_empty()
            && self.volume_claim_templates.is_empty()
            && self.service_templates.is_empty()
    }

    pub fn pod_template(&self, name: &str) -> Option<&ChiPodTemplate> {
        self.pod_templates.iter().find(|t| t.name == name)
    }

    pub fn volume_claim_template(&self, name: &str) -> Option<&VolumeClaimTemplate> {
        self.volume_claim_templates.iter().find(|t| t.name == name)
    }

    pub fn service_template(&self, name: &str) -> Option<&ChiServiceTemplate> {
        self.service_templates.iter().find(|t| t.name == name)
    }

    /// Fold `other`'s templates into `self`, replacing same-named entries.
    pub fn merge(&mut self, other: &ChiTemplates) {
        for template in &other.pod_templates {
            self.pod_templates.retain(|t| t.name != template.name);
            self.pod_templates.push(template.clone());
        }
        for template in &other.volume_claim_templates {
            self.volume_claim_templates.retain(|t| t.name != template.name);
            self.volume_claim_templates.push(template.clone());
        }
        for template in &other.service_templates {
            self.service_templates.retain(|t| t.name != template.name);
            self.service_templates.push(template.clone());
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiPodTemplate {
    pub name: String,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,
    /// Overrides the installation-wide storage management policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<PvcReclaimPolicy>,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiServiceTemplate {
    pub name: String,
    /// Base for the generated service name; object-specific suffixes apply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub spec: ServiceSpec,
}

/// Database-side configuration: topology plus free-form settings sections
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zookeeper: Option<ZookeeperConfig>,
    /// users.xml entries, `path/within/users` -> value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quotas: BTreeMap<String, String>,
    /// config.d entries, `path/within/config` -> value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ChiClusterSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiClusterSpec {
    pub name: String,
    #[serde(default)]
    pub layout: ChiClusterLayout,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates: Option<TemplateRefs>,
}

/// Shard/replica layout, either by count or by explicit list.
/// Explicit lists win; counts fill in what the lists leave out.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiClusterLayout {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<ChiShardSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiShardSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Relative weight of the shard in distributed writes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_replication: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<ChiReplicaSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates: Option<TemplateRefs>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiReplicaSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interserver_http_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates: Option<TemplateRefs>,
}

/// Reference to a ClickHouseInstallationTemplate merged in during normalization
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UseTemplateRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}
