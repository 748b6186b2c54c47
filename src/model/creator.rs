//! Builders for the platform objects owned by an installation
//!
//! A `Creator` is bound to one normalized installation and produces desired
//! Kubernetes objects. Builders are pure: they never talk to the API server.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PersistentVolume,
    PersistentVolumeClaim, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};

use super::config_files::{
    self, ConfigFilesGeneratorOptions, FILE_MACROS, FILE_REMOTE_SERVERS, FILE_SETTINGS,
    FILE_USERS, FILE_ZOOKEEPER,
};
use super::labels::{self, LABEL_STATEFULSET_VERSION};
use super::names;
use super::normalized::{
    HostAttributeMap, NormalizedChi, NormalizedCluster, NormalizedHost, NormalizedShard,
};

const DEFAULT_IMAGE: &str = "clickhouse/clickhouse-server:latest";
const CONTAINER_NAME: &str = "clickhouse";

const VOLUME_COMMON_CONFIG: &str = "chi-common-configd";
const VOLUME_USERS_CONFIG: &str = "chi-common-usersd";
const VOLUME_HOST_CONFIG: &str = "chi-deploy-confd";

/// Builds desired platform objects for one normalized installation.
///
/// A creator is scoped to a single reconcile pass and must not outlive it.
pub struct Creator {
    chi: Arc<NormalizedChi>,
}

impl Creator {
    pub fn new(chi: Arc<NormalizedChi>) -> Self {
        Self { chi }
    }

    pub fn chi(&self) -> &NormalizedChi {
        &self.chi
    }

    fn owner_references(&self) -> Option<Vec<OwnerReference>> {
        self.chi.uid.as_ref().map(|uid| {
            vec![OwnerReference {
                api_version: "clickhouse.example.com/v1".to_string(),
                kind: "ClickHouseInstallation".to_string(),
                name: self.chi.name.clone(),
                uid: uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]
        })
    }

    fn object_meta(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.chi.namespace.clone()),
            labels: Some(labels),
            owner_references: self.owner_references(),
            ..Default::default()
        }
    }

    // ========================================================================
    // Installation-wide objects
    // ========================================================================

    /// Entry-point Service routing client traffic to every host
    pub fn service_chi(&self) -> Service {
        let mut selector = BTreeMap::new();
        selector.insert(labels::LABEL_CHI.to_string(), self.chi.name.clone());
        selector.insert(
            "app.kubernetes.io/managed-by".to_string(),
            labels::MANAGED_BY.to_string(),
        );

        let template = self
            .chi
            .defaults
            .templates
            .as_ref()
            .and_then(|refs| refs.service_template.as_deref())
            .and_then(|name| self.chi.templates.service_template(name));

        let mut spec = template.map(|t| t.spec.clone()).unwrap_or_default();
        if spec.ports.is_none() {
            spec.ports = Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 8123,
                    target_port: Some(IntOrString::Int(8123)),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("tcp".to_string()),
                    port: 9000,
                    target_port: Some(IntOrString::Int(9000)),
                    ..Default::default()
                },
            ]);
        }
        spec.selector = Some(selector);

        Service {
            metadata: self.object_meta(
                names::chi_service_name(&self.chi.name),
                labels::chi_labels(&self.chi),
            ),
            spec: Some(spec),
            status: None,
        }
    }

    /// ConfigMap with the topology, zookeeper and settings sections
    pub fn config_map_chi_common(
        &self,
        options: &ConfigFilesGeneratorOptions,
        attributes: &HostAttributeMap,
    ) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(
            FILE_REMOTE_SERVERS.to_string(),
            config_files::remote_servers_xml(&self.chi, &options.remote_servers, attributes),
        );
        if let Some(zookeeper) = &self.chi.zookeeper {
            data.insert(FILE_ZOOKEEPER.to_string(), config_files::zookeeper_xml(zookeeper));
        }
        if !self.chi.settings.is_empty() {
            data.insert(FILE_SETTINGS.to_string(), config_files::settings_xml(&self.chi));
        }

        ConfigMap {
            metadata: self.object_meta(
                names::common_config_map_name(&self.chi.name),
                labels::chi_labels(&self.chi),
            ),
            data: Some(data),
            ..Default::default()
        }
    }

    /// ConfigMap with the users, profiles and quotas sections
    pub fn config_map_chi_common_users(&self) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(FILE_USERS.to_string(), config_files::users_xml(&self.chi));

        ConfigMap {
            metadata: self.object_meta(
                names::users_config_map_name(&self.chi.name),
                labels::chi_labels(&self.chi),
            ),
            data: Some(data),
            ..Default::default()
        }
    }

    // ========================================================================
    // Cluster / shard objects
    // ========================================================================

    pub fn service_cluster(&self, cluster: &NormalizedCluster) -> Service {
        let cluster_labels = labels::cluster_labels(&cluster.address);
        Service {
            metadata: self.object_meta(
                names::cluster_service_name(&cluster.address),
                cluster_labels.clone(),
            ),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(cluster_labels),
                ports: Some(default_service_ports()),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn service_shard(&self, shard: &NormalizedShard) -> Service {
        let shard_labels = labels::shard_labels(&shard.address);
        Service {
            metadata: self.object_meta(
                names::shard_service_name(&shard.address),
                shard_labels.clone(),
            ),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(shard_labels),
                ports: Some(default_service_ports()),
                ..Default::default()
            }),
            status: None,
        }
    }

    // ========================================================================
    // Host objects
    // ========================================================================

    /// Per-host ConfigMap carrying the host's macros
    pub fn config_map_host(&self, host: &NormalizedHost) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(FILE_MACROS.to_string(), config_files::host_macros_xml(host));

        ConfigMap {
            metadata: self.object_meta(
                names::host_config_map_name(&host.address),
                labels::host_labels(&host.address),
            ),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Headless Service giving the host's pod a stable DNS name
    pub fn service_host(&self, host: &NormalizedHost) -> Service {
        let host_labels = labels::host_labels(&host.address);
        let template = host.templates.service.as_ref();

        let mut spec = template.map(|t| t.spec.clone()).unwrap_or_default();
        if spec.ports.is_none() {
            spec.ports = Some(vec![
                ServicePort {
                    name: Some("tcp".to_string()),
                    port: host.tcp_port as i32,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("http".to_string()),
                    port: host.http_port as i32,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("interserver".to_string()),
                    port: host.interserver_http_port as i32,
                    ..Default::default()
                },
            ]);
        }
        if spec.cluster_ip.is_none() {
            spec.cluster_ip = Some("None".to_string());
        }
        spec.selector = Some(labels::host_selector(&host.address));

        Service {
            metadata: self.object_meta(names::host_service_name(&host.address), host_labels),
            spec: Some(spec),
            status: None,
        }
    }

    /// The host's StatefulSet, stamped with a fingerprint of its spec
    pub fn stateful_set(&self, host: &NormalizedHost) -> StatefulSet {
        let host_labels = labels::host_labels(&host.address);
        let replicas = if self.chi.is_stopped() { 0 } else { 1 };

        let spec = StatefulSetSpec {
            replicas: Some(replicas),
            service_name: names::host_service_name(&host.address),
            selector: LabelSelector {
                match_labels: Some(labels::host_selector(&host.address)),
                ..Default::default()
            },
            template: self.pod_template(host, &host_labels),
            volume_claim_templates: self.volume_claim_templates(host),
            ..Default::default()
        };

        let mut metadata =
            self.object_meta(names::stateful_set_name(&host.address), host_labels);
        metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_STATEFULSET_VERSION.to_string(), fingerprint(&spec));

        StatefulSet {
            metadata,
            spec: Some(spec),
            status: None,
        }
    }

    fn pod_template(
        &self,
        host: &NormalizedHost,
        host_labels: &BTreeMap<String, String>,
    ) -> PodTemplateSpec {
        let mut pod_spec = host
            .templates
            .pod
            .as_ref()
            .map(|t| t.spec.clone())
            .unwrap_or_else(|| default_pod_spec(host));

        if pod_spec.containers.is_empty() {
            pod_spec.containers = default_pod_spec(host).containers;
        }

        self.attach_config_volumes(host, &mut pod_spec);

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(host_labels.clone()),
                ..Default::default()
            }),
            spec: Some(pod_spec),
        }
    }

    /// Mount the three config ConfigMaps and the claimed volumes into every
    /// container, skipping mounts the pod template already declares.
    fn attach_config_volumes(&self, host: &NormalizedHost, pod_spec: &mut PodSpec) {
        let config_volumes = [
            (VOLUME_COMMON_CONFIG, names::common_config_map_name(&self.chi.name), "/etc/clickhouse-server/config.d"),
            (VOLUME_USERS_CONFIG, names::users_config_map_name(&self.chi.name), "/etc/clickhouse-server/users.d"),
            (VOLUME_HOST_CONFIG, names::host_config_map_name(&host.address), "/etc/clickhouse-server/conf.d"),
        ];

        let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
        for (volume_name, config_map_name, _) in &config_volumes {
            if volumes.iter().any(|v| v.name == *volume_name) {
                continue;
            }
            volumes.push(Volume {
                name: volume_name.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(config_map_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let mut claim_mounts: Vec<(String, String)> = Vec::new();
        if let Some(data) = &host.templates.data_volume_claim {
            claim_mounts.push((data.name.clone(), "/var/lib/clickhouse".to_string()));
        }
        if let Some(log) = &host.templates.log_volume_claim {
            claim_mounts.push((log.name.clone(), "/var/log/clickhouse-server".to_string()));
        }

        for container in &mut pod_spec.containers {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            for (volume_name, _, mount_path) in &config_volumes {
                if mounts.iter().any(|m| m.name == *volume_name) {
                    continue;
                }
                mounts.push(VolumeMount {
                    name: volume_name.to_string(),
                    mount_path: mount_path.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
            for (claim_name, mount_path) in &claim_mounts {
                if mounts.iter().any(|m| m.name == *claim_name) {
                    continue;
                }
                mounts.push(VolumeMount {
                    name: claim_name.clone(),
                    mount_path: mount_path.clone(),
                    ..Default::default()
                });
            }
        }
    }

    fn volume_claim_templates(&self, host: &NormalizedHost) -> Option<Vec<PersistentVolumeClaim>> {
        let claims: Vec<PersistentVolumeClaim> = host
            .volume_claim_templates()
            .into_iter()
            .map(|template| PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(template.name.clone()),
                    ..Default::default()
                },
                spec: Some(template.spec.clone()),
                status: None,
            })
            .collect();

        if claims.is_empty() {
            None
        } else {
            Some(claims)
        }
    }

    /// Stamp host ownership labels on a PersistentVolume, preserving what is
    /// already there.
    pub fn prepare_persistent_volume(
        &self,
        mut pv: PersistentVolume,
        host: &NormalizedHost,
    ) -> PersistentVolume {
        let labels = pv.metadata.labels.get_or_insert_with(Default::default);
        for (key, value) in labels::host_labels(&host.address) {
            labels.entry(key).or_insert(value);
        }
        pv
    }
}

fn default_service_ports() -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: Some("tcp".to_string()),
            port: 9000,
            ..Default::default()
        },
        ServicePort {
            name: Some("http".to_string()),
            port: 8123,
            ..Default::default()
        },
    ]
}

fn default_pod_spec(host: &NormalizedHost) -> PodSpec {
    PodSpec {
        containers: vec![Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(DEFAULT_IMAGE.to_string()),
            ports: Some(vec![
                ContainerPort {
                    name: Some("tcp".to_string()),
                    container_port: host.tcp_port as i32,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("http".to_string()),
                    container_port: host.http_port as i32,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("interserver".to_string()),
                    container_port: host.interserver_http_port as i32,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Stable fingerprint of a StatefulSet spec, carried as a label so an
/// unchanged spec can be recognized without a deep diff.
pub fn fingerprint(spec: &StatefulSetSpec) -> String {
    let serialized = serde_json::to_vec(spec).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ChiPodTemplate, VolumeClaimTemplate};
    use crate::model::normalized::{HostAddress, ResolvedTemplates};

    fn host() -> NormalizedHost {
        NormalizedHost {
            address: HostAddress {
                namespace: "ns".to_string(),
                chi_name: "c1".to_string(),
                cluster_index: 0,
                cluster_name: "events".to_string(),
                shard_index: 0,
                shard_name: "0".to_string(),
                replica_index: 0,
                host_name: "chi-c1-events-0-0".to_string(),
            },
            tcp_port: 9000,
            http_port: 8123,
            interserver_http_port: 9009,
            templates: ResolvedTemplates {
                data_volume_claim: Some(VolumeClaimTemplate {
                    name: "data".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    fn chi() -> Arc<NormalizedChi> {
        Arc::new(NormalizedChi {
            namespace: "ns".to_string(),
            name: "c1".to_string(),
            uid: Some("uid-1".to_string()),
            resource_version: None,
            deletion_scheduled: false,
            finalizers: vec![],
            stop: false,
            reconciling: Default::default(),
            defaults: Default::default(),
            zookeeper: None,
            users: Default::default(),
            profiles: Default::default(),
            quotas: Default::default(),
            settings: Default::default(),
            templates: Default::default(),
            clusters: vec![],
        })
    }

    #[test]
    fn test_stateful_set_carries_fingerprint_label() {
        let creator = Creator::new(chi());
        let sts = creator.stateful_set(&host());

        let label = sts
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_STATEFULSET_VERSION))
            .cloned()
            .unwrap();
        assert_eq!(label, fingerprint(sts.spec.as_ref().unwrap()));
    }

    #[test]
    fn test_identical_hosts_share_a_fingerprint() {
        let creator = Creator::new(chi());
        let a = creator.stateful_set(&host());
        let b = creator.stateful_set(&host());
        assert_eq!(
            a.metadata.labels.as_ref().unwrap()[LABEL_STATEFULSET_VERSION],
            b.metadata.labels.as_ref().unwrap()[LABEL_STATEFULSET_VERSION],
        );
    }

    #[test]
    fn test_stateful_set_claims_declared_volumes() {
        let creator = Creator::new(chi());
        let sts = creator.stateful_set(&host());
        let spec = sts.spec.unwrap();

        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some("data"));

        let mounts = spec.template.spec.unwrap().containers[0]
            .volume_mounts
            .clone()
            .unwrap();
        assert!(mounts.iter().any(|m| m.name == "data"));
        assert!(mounts.iter().any(|m| m.name == VOLUME_HOST_CONFIG));
    }

    #[test]
    fn test_stopped_installation_scales_to_zero() {
        let mut stopped = (*chi()).clone();
        stopped.stop = true;
        let creator = Creator::new(Arc::new(stopped));
        let sts = creator.stateful_set(&host());
        assert_eq!(sts.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn test_pod_template_containers_are_kept() {
        let mut host = host();
        host.templates.pod = Some(ChiPodTemplate {
            name: "custom".to_string(),
            spec: PodSpec {
                containers: vec![Container {
                    name: "clickhouse".to_string(),
                    image: Some("clickhouse/clickhouse-server:24.3".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        });

        let creator = Creator::new(chi());
        let sts = creator.stateful_set(&host);
        let containers = sts.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(
            containers[0].image.as_deref(),
            Some("clickhouse/clickhouse-server:24.3")
        );
        // Config mounts are attached even to template-supplied containers.
        assert!(containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == VOLUME_COMMON_CONFIG));
    }

    #[test]
    fn test_host_service_is_headless() {
        let creator = Creator::new(chi());
        let service = creator.service_host(&host());
        assert_eq!(service.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn test_prepare_persistent_volume_preserves_existing_labels() {
        let creator = Creator::new(chi());
        let mut pv = PersistentVolume::default();
        pv.metadata.labels = Some(
            [("keep".to_string(), "me".to_string())]
                .into_iter()
                .collect(),
        );

        let prepared = creator.prepare_persistent_volume(pv, &host());
        let labels = prepared.metadata.labels.unwrap();
        assert_eq!(labels.get("keep").map(String::as_str), Some("me"));
        assert!(labels.contains_key(labels::LABEL_CHI));
    }
}
