//! ClickHouse configuration file rendering
//!
//! The common and users ConfigMaps carry XML fragments dropped into the
//! server's conf.d / users.d directories. Rendering is pure: the same
//! normalized installation and options always produce the same bytes.

use std::collections::BTreeMap;

use super::names;
use super::normalized::{
    HostAddress, HostAttributeMap, NormalizedChi, NormalizedHost, ReconcileAttributes,
};
use crate::crd::ZookeeperConfig;

pub const FILE_REMOTE_SERVERS: &str = "remote_servers.xml";
pub const FILE_ZOOKEEPER: &str = "zookeeper.xml";
pub const FILE_SETTINGS: &str = "settings.xml";
pub const FILE_USERS: &str = "users.xml";
pub const FILE_MACROS: &str = "macros.xml";

/// Options recognized by the config files generator.
///
/// The set is closed: only the remote_servers section is parameterizable,
/// and only through the two exclusion knobs below.
#[derive(Clone, Debug, Default)]
pub struct ConfigFilesGeneratorOptions {
    pub remote_servers: RemoteServersOptions,
}

impl ConfigFilesGeneratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_servers(mut self, options: RemoteServersOptions) -> Self {
        self.remote_servers = options;
        self
    }
}

/// Exclusion knobs for the generated remote_servers topology
#[derive(Clone, Debug, Default)]
pub struct RemoteServersOptions {
    exclude_host: Option<HostAddress>,
    exclude_attributes: Option<ReconcileAttributes>,
}

impl RemoteServersOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Omit one specific host from the topology
    pub fn exclude_host(mut self, address: HostAddress) -> Self {
        self.exclude_host = Some(address);
        self
    }

    /// Omit every host whose reconcile attributes intersect the mask
    pub fn exclude_reconcile_attributes(mut self, mask: ReconcileAttributes) -> Self {
        self.exclude_attributes = Some(mask);
        self
    }

    /// Whether a host stays in the generated topology
    pub fn includes(&self, host: &HostAddress, attributes: ReconcileAttributes) -> bool {
        if self.exclude_host.as_ref() == Some(host) {
            return false;
        }
        if let Some(mask) = &self.exclude_attributes {
            if attributes.intersects(mask) {
                return false;
            }
        }
        true
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn host_dns_name(chi: &NormalizedChi, host: &NormalizedHost) -> String {
    if chi.defaults.replicas_use_fqdn {
        names::host_pod_fqdn(&host.address)
    } else {
        names::host_pod_domain(&host.address)
    }
}

/// Render the remote_servers section, applying the exclusion options against
/// the reconcile attribute table.
pub fn remote_servers_xml(
    chi: &NormalizedChi,
    options: &RemoteServersOptions,
    attributes: &HostAttributeMap,
) -> String {
    let mut xml = String::new();
    xml.push_str("<clickhouse>\n  <remote_servers>\n");
    for cluster in &chi.clusters {
        xml.push_str(&format!("    <{}>\n", escape(&cluster.address.cluster_name)));
        for shard in &cluster.shards {
            xml.push_str("      <shard>\n");
            xml.push_str(&format!(
                "        <internal_replication>{}</internal_replication>\n",
                shard.internal_replication
            ));
            if shard.weight != 1 {
                xml.push_str(&format!("        <weight>{}</weight>\n", shard.weight));
            }
            for host in &shard.hosts {
                if !options.includes(&host.address, attributes.get(&host.address)) {
                    continue;
                }
                xml.push_str("        <replica>\n");
                xml.push_str(&format!(
                    "          <host>{}</host>\n",
                    escape(&host_dns_name(chi, host))
                ));
                xml.push_str(&format!("          <port>{}</port>\n", host.tcp_port));
                xml.push_str("        </replica>\n");
            }
            xml.push_str("      </shard>\n");
        }
        xml.push_str(&format!("    </{}>\n", escape(&cluster.address.cluster_name)));
    }
    xml.push_str("  </remote_servers>\n</clickhouse>\n");
    xml
}

pub fn zookeeper_xml(zookeeper: &ZookeeperConfig) -> String {
    let mut xml = String::new();
    xml.push_str("<clickhouse>\n  <zookeeper>\n");
    for node in &zookeeper.nodes {
        xml.push_str("    <node>\n");
        xml.push_str(&format!("      <host>{}</host>\n", escape(&node.host)));
        xml.push_str(&format!("      <port>{}</port>\n", node.port()));
        xml.push_str("    </node>\n");
    }
    if let Some(timeout) = zookeeper.session_timeout_ms {
        xml.push_str(&format!(
            "    <session_timeout_ms>{}</session_timeout_ms>\n",
            timeout
        ));
    }
    if let Some(timeout) = zookeeper.operation_timeout_ms {
        xml.push_str(&format!(
            "    <operation_timeout_ms>{}</operation_timeout_ms>\n",
            timeout
        ));
    }
    if let Some(root) = &zookeeper.root {
        xml.push_str(&format!("    <root>{}</root>\n", escape(root)));
    }
    if let Some(identity) = &zookeeper.identity {
        xml.push_str(&format!("    <identity>{}</identity>\n", escape(identity)));
    }
    xml.push_str("  </zookeeper>\n");
    xml.push_str("  <distributed_ddl>\n    <path>/clickhouse/task_queue/ddl</path>\n  </distributed_ddl>\n");
    xml.push_str("</clickhouse>\n");
    xml
}

/// Render a flat `path/to/key -> value` map as nested XML elements
fn paths_xml(entries: &BTreeMap<String, String>, indent: &str) -> String {
    let mut xml = String::new();
    for (path, value) in entries {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            continue;
        }
        for (depth, segment) in segments.iter().enumerate() {
            if depth + 1 == segments.len() {
                xml.push_str(&format!(
                    "{}{}<{}>{}</{}>\n",
                    indent,
                    "  ".repeat(depth),
                    escape(segment),
                    escape(value),
                    escape(segment)
                ));
            } else {
                xml.push_str(&format!("{}{}<{}>\n", indent, "  ".repeat(depth), escape(segment)));
            }
        }
        for (depth, segment) in segments.iter().enumerate().rev() {
            if depth + 1 != segments.len() {
                xml.push_str(&format!("{}{}</{}>\n", indent, "  ".repeat(depth), escape(segment)));
            }
        }
    }
    xml
}

pub fn settings_xml(chi: &NormalizedChi) -> String {
    let mut xml = String::new();
    xml.push_str("<clickhouse>\n");
    xml.push_str(&paths_xml(&chi.settings, "  "));
    xml.push_str("</clickhouse>\n");
    xml
}

pub fn users_xml(chi: &NormalizedChi) -> String {
    let mut xml = String::new();
    xml.push_str("<clickhouse>\n");
    xml.push_str("  <users>\n");
    xml.push_str(&paths_xml(&chi.users, "    "));
    xml.push_str("  </users>\n");
    if !chi.profiles.is_empty() {
        xml.push_str("  <profiles>\n");
        xml.push_str(&paths_xml(&chi.profiles, "    "));
        xml.push_str("  </profiles>\n");
    }
    if !chi.quotas.is_empty() {
        xml.push_str("  <quotas>\n");
        xml.push_str(&paths_xml(&chi.quotas, "    "));
        xml.push_str("  </quotas>\n");
    }
    xml.push_str("</clickhouse>\n");
    xml
}

/// Per-host macros used by replicated table definitions
pub fn host_macros_xml(host: &NormalizedHost) -> String {
    let address = &host.address;
    format!(
        "<clickhouse>\n  <macros>\n    <installation>{}</installation>\n    <cluster>{}</cluster>\n    <shard>{}</shard>\n    <replica>{}</replica>\n  </macros>\n</clickhouse>\n",
        escape(&address.chi_name),
        escape(&address.cluster_name),
        escape(&address.shard_name),
        escape(&names::pod_name(address)),
    )
}
