//! Deterministic names for every object the operator owns
//!
//! Naming is a pure function of the owning node's address, so a name can be
//! recomputed at any point of a reconcile or teardown without fetching state.

use super::normalized::{ClusterAddress, HostAddress, ShardAddress};

/// Entry-point service of the installation
pub fn chi_service_name(chi_name: &str) -> String {
    format!("clickhouse-{}", chi_name)
}

/// ConfigMap carrying remote_servers, zookeeper and settings sections
pub fn common_config_map_name(chi_name: &str) -> String {
    format!("chi-{}-common-configd", chi_name)
}

/// ConfigMap carrying users, profiles and quotas sections
pub fn users_config_map_name(chi_name: &str) -> String {
    format!("chi-{}-common-usersd", chi_name)
}

pub fn cluster_service_name(address: &ClusterAddress) -> String {
    format!("cluster-{}-{}", address.chi_name, address.cluster_name)
}

pub fn shard_service_name(address: &ShardAddress) -> String {
    format!(
        "shard-{}-{}-{}",
        address.chi_name, address.cluster_name, address.shard_name
    )
}

/// Base name shared by a host's StatefulSet and Service
pub fn host_base_name(address: &HostAddress) -> String {
    format!(
        "chi-{}-{}-{}-{}",
        address.chi_name, address.cluster_name, address.shard_index, address.replica_index
    )
}

pub fn stateful_set_name(address: &HostAddress) -> String {
    host_base_name(address)
}

pub fn host_service_name(address: &HostAddress) -> String {
    host_base_name(address)
}

pub fn host_config_map_name(address: &HostAddress) -> String {
    format!(
        "chi-{}-deploy-confd-{}-{}-{}",
        address.chi_name, address.cluster_name, address.shard_index, address.replica_index
    )
}

/// Name of the single pod a host's StatefulSet manages
pub fn pod_name(address: &HostAddress) -> String {
    format!("{}-0", stateful_set_name(address))
}

/// In-cluster DNS name of a host's pod, via its headless service
pub fn host_pod_fqdn(address: &HostAddress) -> String {
    format!(
        "{}.{}.{}.svc.cluster.local",
        pod_name(address),
        host_service_name(address),
        address.namespace
    )
}

/// Namespace-relative DNS name, used when FQDNs are not requested
pub fn host_pod_domain(address: &HostAddress) -> String {
    format!(
        "{}.{}.{}",
        pod_name(address),
        host_service_name(address),
        address.namespace
    )
}

/// PVC name the StatefulSet controller derives for a claim template
pub fn pvc_name(template_name: &str, address: &HostAddress) -> String {
    format!("{}-{}", template_name, pod_name(address))
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
            shard_index: 1,
            shard_name: "events-1".to_string(),
            replica_index: 2,
            host_name: "chi-c1-events-1-2".to_string(),
        }
    }

    #[test]
    fn test_host_name_is_derivable_from_address() {
        assert_eq!(host_base_name(&address()), "chi-c1-events-1-2");
        assert_eq!(address().host_name, host_base_name(&address()));
    }

    #[test]
    fn test_pod_fqdn_goes_through_host_service() {
        assert_eq!(
            host_pod_fqdn(&address()),
            "chi-c1-events-1-2-0.chi-c1-events-1-2.ns.svc.cluster.local"
        );
    }

    #[test]
    fn test_pvc_name_follows_stateful_set_convention() {
        assert_eq!(pvc_name("data", &address()), "data-chi-c1-events-1-2-0");
    }

    #[test]
    fn test_config_map_names_are_distinct() {
        assert_ne!(common_config_map_name("c1"), users_config_map_name("c1"));
    }
}
