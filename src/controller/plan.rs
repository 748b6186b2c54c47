//! Action plan: structural diff of two normalized installations
//!
//! The plan classifies clusters, shards and hosts into added, removed and
//! modified sets. Identity is positional naming (the address), so a renamed
//! node is a remove plus an add. A node appears in at most one set, and the
//! children of an added or removed parent are not listed separately; walkers
//! visit them through the parent.

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{NormalizedChi, NormalizedCluster, NormalizedHost, NormalizedShard};

/// Index paths into the trees backing the plan
type ClusterIdx = usize;
type ShardIdx = (usize, usize);
type HostIdx = (usize, usize, usize);

/// Diff of two normalized installations at cluster, shard and host
/// granularity. Computation is order-insensitive; walks visit nodes in
/// declaration order.
pub struct ActionPlan {
    old: Option<Arc<NormalizedChi>>,
    new: Arc<NormalizedChi>,

    clusters_added: Vec<ClusterIdx>,
    clusters_removed: Vec<ClusterIdx>,
    clusters_modified: Vec<ClusterIdx>,

    shards_added: Vec<ShardIdx>,
    shards_removed: Vec<ShardIdx>,
    shards_modified: Vec<ShardIdx>,

    hosts_added: Vec<HostIdx>,
    hosts_removed: Vec<HostIdx>,
    hosts_modified: Vec<HostIdx>,
}

impl ActionPlan {
    pub fn new(old: Option<Arc<NormalizedChi>>, new: Arc<NormalizedChi>) -> Self {
        let mut plan = ActionPlan {
            old,
            new,
            clusters_added: Vec::new(),
            clusters_removed: Vec::new(),
            clusters_modified: Vec::new(),
            shards_added: Vec::new(),
            shards_removed: Vec::new(),
            shards_modified: Vec::new(),
            hosts_added: Vec::new(),
            hosts_removed: Vec::new(),
            hosts_modified: Vec::new(),
        };
        plan.compute();
        plan
    }

    fn compute(&mut self) {
        let new = self.new.clone();
        let Some(old) = self.old.clone() else {
            // No prior state: the whole new tree is added, at cluster level.
            self.clusters_added = (0..new.clusters.len()).collect();
            return;
        };

        let old_names: HashSet<&str> = old
            .clusters
            .iter()
            .map(|c| c.address.cluster_name.as_str())
            .collect();
        let new_names: HashSet<&str> = new
            .clusters
            .iter()
            .map(|c| c.address.cluster_name.as_str())
            .collect();

        for (ci, cluster) in new.clusters.iter().enumerate() {
            if !old_names.contains(cluster.address.cluster_name.as_str()) {
                self.clusters_added.push(ci);
            }
        }
        for (ci, cluster) in old.clusters.iter().enumerate() {
            if !new_names.contains(cluster.address.cluster_name.as_str()) {
                self.clusters_removed.push(ci);
            }
        }

        for (ci, new_cluster) in new.clusters.iter().enumerate() {
            let Some((old_ci, old_cluster)) = old
                .clusters
                .iter()
                .enumerate()
                .find(|(_, c)| c.address.cluster_name == new_cluster.address.cluster_name)
            else {
                continue;
            };
            if new_cluster != old_cluster {
                self.clusters_modified.push(ci);
            }
            self.compute_shards(ci, old_ci, old_cluster, new_cluster);
        }
    }

    fn compute_shards(
        &mut self,
        ci: usize,
        old_ci: usize,
        old_cluster: &NormalizedCluster,
        new_cluster: &NormalizedCluster,
    ) {
        let old_names: HashSet<&str> = old_cluster
            .shards
            .iter()
            .map(|s| s.address.shard_name.as_str())
            .collect();
        let new_names: HashSet<&str> = new_cluster
            .shards
            .iter()
            .map(|s| s.address.shard_name.as_str())
            .collect();

        for (si, shard) in new_cluster.shards.iter().enumerate() {
            if !old_names.contains(shard.address.shard_name.as_str()) {
                self.shards_added.push((ci, si));
            }
        }
        for (si, shard) in old_cluster.shards.iter().enumerate() {
            if !new_names.contains(shard.address.shard_name.as_str()) {
                self.shards_removed.push((old_ci, si));
            }
        }

        for (si, new_shard) in new_cluster.shards.iter().enumerate() {
            let Some((old_si, old_shard)) = old_cluster
                .shards
                .iter()
                .enumerate()
                .find(|(_, s)| s.address.shard_name == new_shard.address.shard_name)
            else {
                continue;
            };
            if new_shard != old_shard {
                self.shards_modified.push((ci, si));
            }
            self.compute_hosts(ci, si, old_ci, old_si, old_shard, new_shard);
        }
    }

    fn compute_hosts(
        &mut self,
        ci: usize,
        si: usize,
        old_ci: usize,
        old_si: usize,
        old_shard: &NormalizedShard,
        new_shard: &NormalizedShard,
    ) {
        let old_names: HashSet<&str> = old_shard
            .hosts
            .iter()
            .map(|h| h.address.host_name.as_str())
            .collect();
        let new_names: HashSet<&str> = new_shard
            .hosts
            .iter()
            .map(|h| h.address.host_name.as_str())
            .collect();

        for (hi, host) in new_shard.hosts.iter().enumerate() {
            if !old_names.contains(host.address.host_name.as_str()) {
                self.hosts_added.push((ci, si, hi));
            }
        }
        for (hi, host) in old_shard.hosts.iter().enumerate() {
            if !new_names.contains(host.address.host_name.as_str()) {
                self.hosts_removed.push((old_ci, old_si, hi));
            }
        }
        for (hi, new_host) in new_shard.hosts.iter().enumerate() {
            let modified = old_shard
                .hosts
                .iter()
                .any(|old_host| {
                    old_host.address.host_name == new_host.address.host_name
                        && old_host != new_host
                });
            if modified {
                self.hosts_modified.push((ci, si, hi));
            }
        }
    }

    /// Whether the plan carries any change at all
    pub fn has_actions(&self) -> bool {
        !(self.clusters_added.is_empty()
            && self.clusters_removed.is_empty()
            && self.clusters_modified.is_empty()
            && self.shards_added.is_empty()
            && self.shards_removed.is_empty()
            && self.shards_modified.is_empty()
            && self.hosts_added.is_empty()
            && self.hosts_removed.is_empty()
            && self.hosts_modified.is_empty())
    }

    /// Hosts scheduled for removal, including hosts of removed parents
    pub fn removed_hosts_count(&self) -> usize {
        let Some(old) = &self.old else { return 0 };
        let mut count = self.hosts_removed.len();
        for &ci in &self.clusters_removed {
            count += old.clusters[ci].hosts_count();
        }
        for &(ci, si) in &self.shards_removed {
            count += old.clusters[ci].shards[si].hosts.len();
        }
        count
    }

    /// Visit every added node in declaration order
    pub fn walk_added(
        &self,
        mut cluster_cb: impl FnMut(&NormalizedCluster),
        mut shard_cb: impl FnMut(&NormalizedShard),
        mut host_cb: impl FnMut(&NormalizedHost),
    ) {
        for &ci in &self.clusters_added {
            cluster_cb(&self.new.clusters[ci]);
        }
        for &(ci, si) in &self.shards_added {
            shard_cb(&self.new.clusters[ci].shards[si]);
        }
        for &(ci, si, hi) in &self.hosts_added {
            host_cb(&self.new.clusters[ci].shards[si].hosts[hi]);
        }
    }

    /// Visit every modified node in declaration order
    pub fn walk_modified(
        &self,
        mut cluster_cb: impl FnMut(&NormalizedCluster),
        mut shard_cb: impl FnMut(&NormalizedShard),
        mut host_cb: impl FnMut(&NormalizedHost),
    ) {
        for &ci in &self.clusters_modified {
            cluster_cb(&self.new.clusters[ci]);
        }
        for &(ci, si) in &self.shards_modified {
            shard_cb(&self.new.clusters[ci].shards[si]);
        }
        for &(ci, si, hi) in &self.hosts_modified {
            host_cb(&self.new.clusters[ci].shards[si].hosts[hi]);
        }
    }

    /// Visit every removed node (resolved against the old tree) in
    /// declaration order
    pub fn walk_removed(
        &self,
        mut cluster_cb: impl FnMut(&NormalizedCluster),
        mut shard_cb: impl FnMut(&NormalizedShard),
        mut host_cb: impl FnMut(&NormalizedHost),
    ) {
        let Some(old) = &self.old else { return };
        for &ci in &self.clusters_removed {
            cluster_cb(&old.clusters[ci]);
        }
        for &(ci, si) in &self.shards_removed {
            shard_cb(&old.clusters[ci].shards[si]);
        }
        for &(ci, si, hi) in &self.hosts_removed {
            host_cb(&old.clusters[ci].shards[si].hosts[hi]);
        }
    }
}
