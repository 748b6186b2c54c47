//! Labels the operator stamps on every owned object
//!
//! Ownership is expressed through labels rather than owner references alone:
//! the DropDNS path resolves an installation back from an owned object's
//! labels, and selectors use the same keys.

use std::collections::BTreeMap;

use super::normalized::{ClusterAddress, HostAddress, NormalizedChi, ShardAddress};

pub const LABEL_CHI: &str = "clickhouse.example.com/chi";
pub const LABEL_CLUSTER: &str = "clickhouse.example.com/cluster";
pub const LABEL_SHARD: &str = "clickhouse.example.com/shard";
pub const LABEL_REPLICA: &str = "clickhouse.example.com/replica";
/// Fingerprint of the desired StatefulSet spec; equal labels mean equal specs
pub const LABEL_STATEFULSET_VERSION: &str = "clickhouse.example.com/statefulset-version";
pub const MANAGED_BY: &str = "clickhouse-operator";

fn base_labels(chi_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(LABEL_CHI.to_string(), chi_name.to_string());
    labels
}

pub fn chi_labels(chi: &NormalizedChi) -> BTreeMap<String, String> {
    base_labels(&chi.name)
}

pub fn cluster_labels(address: &ClusterAddress) -> BTreeMap<String, String> {
    let mut labels = base_labels(&address.chi_name);
    labels.insert(LABEL_CLUSTER.to_string(), address.cluster_name.clone());
    labels
}

pub fn shard_labels(address: &ShardAddress) -> BTreeMap<String, String> {
    let mut labels = base_labels(&address.chi_name);
    labels.insert(LABEL_CLUSTER.to_string(), address.cluster_name.clone());
    labels.insert(LABEL_SHARD.to_string(), address.shard_name.clone());
    labels
}

pub fn host_labels(address: &HostAddress) -> BTreeMap<String, String> {
    let mut labels = base_labels(&address.chi_name);
    labels.insert(LABEL_CLUSTER.to_string(), address.cluster_name.clone());
    labels.insert(LABEL_SHARD.to_string(), address.shard_name.clone());
    labels.insert(
        LABEL_REPLICA.to_string(),
        address.replica_index.to_string(),
    );
    labels
}

/// Selector matching exactly one host's pod
pub fn host_selector(address: &HostAddress) -> BTreeMap<String, String> {
    host_labels(address)
}

/// Installation name recorded on an owned object, if any
pub fn chi_name_from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<String> {
    labels.and_then(|l| l.get(LABEL_CHI)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> HostAddress {
        HostAddress {
            namespace: "ns".to_string(),
            chi_name: "c1".to_string(),
            cluster_index: 0,
            cluster_name: "events".to_string(),
            shard_index: 0,
            shard_name: "events-0".to_string(),
            replica_index: 1,
            host_name: "chi-c1-events-0-1".to_string(),
        }
    }

    #[test]
    fn test_host_labels_identify_full_path() {
        let labels = host_labels(&address());
        assert_eq!(labels.get(LABEL_CHI).unwrap(), "c1");
        assert_eq!(labels.get(LABEL_CLUSTER).unwrap(), "events");
        assert_eq!(labels.get(LABEL_SHARD).unwrap(), "events-0");
        assert_eq!(labels.get(LABEL_REPLICA).unwrap(), "1");
    }

    #[test]
    fn test_chi_name_round_trips_through_labels() {
        let labels = host_labels(&address());
        assert_eq!(chi_name_from_labels(Some(&labels)).unwrap(), "c1");
        assert_eq!(chi_name_from_labels(None), None);
    }
}
