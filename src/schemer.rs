//! SQL-side operations against ClickHouse hosts
//!
//! The reconciler drives schema convergence and membership probes through
//! the [`Schemer`] trait; the production implementation talks to the
//! ClickHouse HTTP interface.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::model::{names, NormalizedChi, NormalizedHost};

/// Schema and membership operations on individual hosts.
///
/// Every operation is idempotent: re-running it against a converged host is
/// a no-op on the database side.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Schemer: Send + Sync {
    /// Materialize the schemas a replica needs, copying DDL from a peer
    /// replica of the same shard.
    async fn host_create_tables(&self, chi: &NormalizedChi, host: &NormalizedHost) -> Result<()>;

    /// Drop all managed tables on the host. Required before discarding its
    /// volumes, otherwise Zookeeper keeps metadata of dead replicas.
    async fn host_delete_tables(&self, host: &NormalizedHost) -> Result<()>;

    /// Whether the host currently sees itself as a member of its cluster
    /// topology (`system.clusters`, local records).
    async fn is_host_in_cluster(&self, host: &NormalizedHost) -> bool;

    /// Flush DNS caches on every host of the installation.
    async fn chi_drop_dns_cache(&self, chi: &NormalizedChi) -> Result<()>;
}

/// [`Schemer`] implementation over the ClickHouse HTTP interface
pub struct HttpSchemer {
    http: reqwest::Client,
    username: String,
    password: String,
    port: u16,
}

impl HttpSchemer {
    pub fn new(config: &OperatorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            username: config.ch_username.clone(),
            password: config.ch_password.clone(),
            port: config.ch_http_port,
        }
    }

    async fn query(&self, fqdn: &str, sql: &str) -> Result<String> {
        let url = format!("http://{}:{}/", fqdn, self.port);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .body(sql.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::SchemaError {
                host: fqdn.to_string(),
                message: format!("{}: {}", status, body.trim()),
            });
        }
        Ok(body)
    }

    async fn execute(&self, fqdn: &str, sql: &str) -> Result<()> {
        debug!("executing on {}: {}", fqdn, sql);
        self.query(fqdn, sql).await.map(|_| ())
    }
}

#[async_trait]
impl Schemer for HttpSchemer {
    async fn host_create_tables(&self, chi: &NormalizedChi, host: &NormalizedHost) -> Result<()> {
        let Some(peer) = replication_peer(chi, host) else {
            debug!("host {} has no replication peer, nothing to copy", host.address);
            return Ok(());
        };
        let peer_fqdn = names::host_pod_fqdn(&peer.address);
        let host_fqdn = names::host_pod_fqdn(&host.address);

        let databases = self.query(&peer_fqdn, SQL_MANAGED_DATABASES).await?;
        for database in databases.lines().filter(|l| !l.is_empty()) {
            let name = unescape_tsv(database);
            self.execute(&host_fqdn, &format!("CREATE DATABASE IF NOT EXISTS `{}`", name))
                .await?;
        }

        let tables = self.query(&peer_fqdn, SQL_MANAGED_TABLE_DDL).await?;
        for line in tables.lines().filter(|l| !l.is_empty()) {
            let ddl = unescape_tsv(line);
            self.execute(&host_fqdn, &ddl).await?;
        }

        Ok(())
    }

    async fn host_delete_tables(&self, host: &NormalizedHost) -> Result<()> {
        let fqdn = names::host_pod_fqdn(&host.address);

        let tables = self.query(&fqdn, SQL_MANAGED_TABLE_NAMES).await?;
        for line in tables.lines().filter(|l| !l.is_empty()) {
            let table = unescape_tsv(line);
            self.execute(&fqdn, &format!("DROP TABLE IF EXISTS {} SYNC", table))
                .await?;
        }

        Ok(())
    }

    async fn is_host_in_cluster(&self, host: &NormalizedHost) -> bool {
        let fqdn = names::host_pod_fqdn(&host.address);
        let sql = format!(
            "SELECT count() FROM system.clusters WHERE cluster = '{}' AND is_local",
            host.address.cluster_name.replace('\'', "\\'")
        );
        match self.query(&fqdn, &sql).await {
            Ok(body) => body.trim().parse::<u64>().map(|n| n > 0).unwrap_or(false),
            Err(err) => {
                debug!("membership probe of {} failed: {}", host.address, err);
                false
            }
        }
    }

    async fn chi_drop_dns_cache(&self, chi: &NormalizedChi) -> Result<()> {
        let mut first_error = None;
        for host in chi.hosts() {
            let fqdn = names::host_pod_fqdn(&host.address);
            if let Err(err) = self.execute(&fqdn, "SYSTEM DROP DNS CACHE").await {
                warn!("DNS cache flush on {} failed: {}", host.address, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

const SQL_MANAGED_DATABASES: &str = "SELECT DISTINCT name \
    FROM system.databases \
    WHERE name NOT IN ('system', 'information_schema', 'INFORMATION_SCHEMA', 'default') \
    FORMAT TabSeparated";

const SQL_MANAGED_TABLE_DDL: &str = "SELECT DISTINCT replaceRegexpOne(create_table_query, \
    'CREATE (TABLE|VIEW|MATERIALIZED VIEW|DICTIONARY)', 'CREATE \\\\1 IF NOT EXISTS') \
    FROM system.tables \
    WHERE database NOT IN ('system', 'information_schema', 'INFORMATION_SCHEMA') \
      AND create_table_query != '' AND name NOT LIKE '.inner%' \
    FORMAT TabSeparated";

const SQL_MANAGED_TABLE_NAMES: &str = "SELECT DISTINCT concat(database, '.', name) \
    FROM system.tables \
    WHERE database NOT IN ('system', 'information_schema', 'INFORMATION_SCHEMA') \
      AND name NOT LIKE '.inner%' \
    FORMAT TabSeparated";

/// Another host of the same shard, preferring the lowest replica index.
/// Replicas of one shard hold the same tables, so any peer is a valid
/// schema source.
pub(crate) fn replication_peer<'a>(
    chi: &'a NormalizedChi,
    host: &NormalizedHost,
) -> Option<&'a NormalizedHost> {
    chi.shard_of(&host.address)?
        .hosts
        .iter()
        .find(|peer| peer.address != host.address)
}

/// Undo ClickHouse TabSeparated escaping
fn unescape_tsv(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
