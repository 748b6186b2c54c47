//! Unit tests for ChiSpec validation
//!
//! Tests the `ChiSpec::validate()` function to ensure it correctly accepts
//! valid installation layouts and rejects inconsistent ones.

#[cfg(test)]
mod chi_spec_validation {
    use crate::crd::{
        ChiClusterLayout, ChiClusterSpec, ChiConfiguration, ChiPodTemplate, ChiReplicaSpec,
        ChiShardSpec, ChiSpec, ChiTemplates,
    };

    /// Helper to create a minimal valid spec: one cluster, counts only
    fn valid_spec() -> ChiSpec {
        ChiSpec {
            configuration: ChiConfiguration {
                clusters: vec![ChiClusterSpec {
                    name: "events".to_string(),
                    layout: ChiClusterLayout {
                        shards_count: Some(2),
                        replicas_count: Some(2),
                        shards: vec![],
                    },
                    templates: None,
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn named_shard(name: &str) -> ChiShardSpec {
        ChiShardSpec {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_spec_passes_validation() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_empty_configuration_passes() {
        // A bare spec is legal; the normalizer supplies the default cluster.
        let spec = ChiSpec::default();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_empty_cluster_name_fails() {
        let mut spec = valid_spec();
        spec.configuration.clusters[0].name = "  ".to_string();

        let result = spec.validate();
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err(),
            "configuration.clusters[].name must not be empty"
        );
    }

    #[test]
    fn test_duplicate_cluster_name_fails() {
        let mut spec = valid_spec();
        let duplicate = spec.configuration.clusters[0].clone();
        spec.configuration.clusters.push(duplicate);

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("duplicated"));
    }

    #[test]
    fn test_zero_shards_count_fails() {
        let mut spec = valid_spec();
        spec.configuration.clusters[0].layout.shards_count = Some(0);

        let result = spec.validate();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err(), "layout.shardsCount must be at least 1");
    }

    #[test]
    fn test_zero_replicas_count_fails() {
        let mut spec = valid_spec();
        spec.configuration.clusters[0].layout.replicas_count = Some(0);

        let result = spec.validate();
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err(),
            "layout.replicasCount must be at least 1"
        );
    }

    #[test]
    fn test_shards_count_matching_explicit_list_passes() {
        let mut spec = valid_spec();
        let layout = &mut spec.configuration.clusters[0].layout;
        layout.shards_count = Some(2);
        layout.shards = vec![named_shard("a"), named_shard("b")];

        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_shards_count_disagreeing_with_explicit_list_fails() {
        let mut spec = valid_spec();
        let layout = &mut spec.configuration.clusters[0].layout;
        layout.shards_count = Some(3);
        layout.shards = vec![named_shard("a"), named_shard("b")];

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("disagrees"));
    }

    #[test]
    fn test_duplicate_shard_name_fails() {
        let mut spec = valid_spec();
        let layout = &mut spec.configuration.clusters[0].layout;
        layout.shards_count = None;
        layout.shards = vec![named_shard("a"), named_shard("a")];

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("shard name"));
    }

    #[test]
    fn test_unnamed_shards_are_not_duplicates() {
        let mut spec = valid_spec();
        let layout = &mut spec.configuration.clusters[0].layout;
        layout.shards_count = None;
        layout.shards = vec![ChiShardSpec::default(), ChiShardSpec::default()];

        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_replicas_count_disagreeing_with_explicit_list_fails() {
        let mut spec = valid_spec();
        let layout = &mut spec.configuration.clusters[0].layout;
        layout.shards_count = None;
        layout.shards = vec![ChiShardSpec {
            replicas_count: Some(3),
            replicas: vec![ChiReplicaSpec::default()],
            ..Default::default()
        }];

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("shard.replicasCount"));
    }

    #[test]
    fn test_duplicate_replica_name_fails() {
        let mut spec = valid_spec();
        let layout = &mut spec.configuration.clusters[0].layout;
        layout.shards_count = None;
        layout.shards = vec![ChiShardSpec {
            replicas: vec![
                ChiReplicaSpec {
                    name: Some("r0".to_string()),
                    ..Default::default()
                },
                ChiReplicaSpec {
                    name: Some("r0".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }];

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("replica name"));
    }

    #[test]
    fn test_duplicate_pod_template_name_fails() {
        let mut spec = valid_spec();
        spec.templates = ChiTemplates {
            pod_templates: vec![
                ChiPodTemplate {
                    name: "default".to_string(),
                    ..Default::default()
                },
                ChiPodTemplate {
                    name: "default".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("podTemplates"));
    }

    #[test]
    fn test_same_name_across_template_kinds_passes() {
        let mut spec = valid_spec();
        spec.templates.pod_templates = vec![ChiPodTemplate {
            name: "default".to_string(),
            ..Default::default()
        }];
        spec.templates.volume_claim_templates = vec![crate::crd::VolumeClaimTemplate {
            name: "default".to_string(),
            ..Default::default()
        }];

        assert!(spec.validate().is_ok());
    }
}
