//! ClickHouse schemer over the HTTP interface.
//!
//! Implements the `controller::schemer::Schemer` contract against live
//! hosts. Schema migration copies DDL from a sibling replica of the same
//! shard; replica identity and sibling addresses are derived from the host's
//! topology address, so no extra wiring is needed.

use async_trait::async_trait;
use clickhouse::Client;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::schemer::{MigrateTableOptions, Schemer};
use crate::model::topology::{Address, Host};
use crate::resources::common::host_fqdn;

/// Databases that are never migrated.
const SYSTEM_DATABASES: &str = "'system', 'INFORMATION_SCHEMA', 'information_schema'";

/// Schemer talking to ClickHouse over its HTTP interface.
pub struct ClickHouseSchemer {
    user: String,
}

impl ClickHouseSchemer {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    fn client_for(&self, fqdn: &str) -> Client {
        Client::default()
            .with_url(format!("http://{fqdn}:8123"))
            .with_user(self.user.clone())
    }

    fn host_client(&self, host: &Host) -> Client {
        self.client_for(&host_fqdn(host))
    }

    /// Address of a sibling replica in the same shard, if any.
    fn sibling_fqdn(host: &Host) -> Option<String> {
        let address = &host.address;
        (0..host.replicas_in_shard)
            .find(|i| *i != address.replica_index)
            .map(|i| Self::replica_fqdn(address, i))
    }

    fn replica_fqdn(address: &Address, replica_index: usize) -> String {
        let name = format!(
            "chi-{}-{}-{}-{}",
            address.chi_name, address.cluster_name, address.shard_index, replica_index
        );
        format!("{name}-0.{name}.{}.svc", address.namespace)
    }

    async fn fetch_ddl(&self, source: &Client) -> Result<(Vec<String>, Vec<String>)> {
        let databases: Vec<String> = source
            .query(&format!(
                "SELECT DISTINCT database FROM system.tables WHERE database NOT IN ({SYSTEM_DATABASES})"
            ))
            .fetch_all()
            .await
            .map_err(|e| Error::Schemer(e.to_string()))?;

        let tables: Vec<String> = source
            .query(&format!(
                "SELECT create_table_query FROM system.tables \
                 WHERE database NOT IN ({SYSTEM_DATABASES}) AND create_table_query != '' \
                 ORDER BY metadata_modification_time"
            ))
            .fetch_all()
            .await
            .map_err(|e| Error::Schemer(e.to_string()))?;

        Ok((databases, tables))
    }
}

#[async_trait]
impl Schemer for ClickHouseSchemer {
    async fn host_clickhouse_version(&self, host: &Host) -> Result<String> {
        self.host_client(host)
            .query("SELECT version()")
            .fetch_one::<String>()
            .await
            .map_err(|e| Error::Schemer(e.to_string()))
    }

    async fn migrate_tables(&self, host: &Host, options: &MigrateTableOptions) -> Result<()> {
        let Some(sibling) = Self::sibling_fqdn(host) else {
            // Lone replica: there is nothing to replicate the schema from.
            debug!(host = %host.name, "no sibling replica, skipping table migration");
            return Ok(());
        };
        let source = self.client_for(&sibling);

        if options.drop_replica {
            // Stale replication metadata from the lost volume blocks
            // re-registration under the same replica name.
            info!(host = %host.name, "dropping stale replica metadata before migration");
            source
                .query(&format!("SYSTEM DROP REPLICA '{}'", host.name))
                .execute()
                .await
                .map_err(|e| Error::Schemer(e.to_string()))?;
        }

        let (databases, tables) = self.fetch_ddl(&source).await?;
        if databases.is_empty() && tables.is_empty() {
            debug!(host = %host.name, "nothing to migrate");
            return Ok(());
        }

        let target = self.host_client(host);
        for database in databases {
            target
                .query(&format!("CREATE DATABASE IF NOT EXISTS \"{database}\""))
                .execute()
                .await
                .map_err(|e| Error::Schemer(e.to_string()))?;
        }
        for ddl in tables {
            let ddl = make_idempotent(&ddl);
            if options.force_migrate {
                debug!(host = %host.name, "force migrating table");
            }
            target
                .query(&ddl)
                .execute()
                .await
                .map_err(|e| Error::Schemer(e.to_string()))?;
        }

        info!(host = %host.name, "table migration completed");
        Ok(())
    }

    async fn active_queries_count(&self, host: &Host) -> Result<usize> {
        let count: u64 = self
            .host_client(host)
            .query(
                "SELECT count() FROM system.processes WHERE query NOT LIKE '%system.processes%'",
            )
            .fetch_one()
            .await
            .map_err(|e| Error::Schemer(e.to_string()))?;
        Ok(count as usize)
    }

    async fn drop_replica(&self, host: &Host) -> Result<()> {
        let Some(sibling) = Self::sibling_fqdn(host) else {
            debug!(host = %host.name, "no sibling replica to drop from");
            return Ok(());
        };
        self.client_for(&sibling)
            .query(&format!("SYSTEM DROP REPLICA '{}'", host.name))
            .execute()
            .await
            .map_err(|e| Error::Schemer(e.to_string()))
    }
}

/// Rewrite fetched DDL so replaying it on a host that already has some of
/// the objects succeeds.
fn make_idempotent(ddl: &str) -> String {
    for (from, to) in [
        ("CREATE TABLE ", "CREATE TABLE IF NOT EXISTS "),
        ("CREATE VIEW ", "CREATE VIEW IF NOT EXISTS "),
        ("CREATE MATERIALIZED VIEW ", "CREATE MATERIALIZED VIEW IF NOT EXISTS "),
        ("CREATE DICTIONARY ", "CREATE DICTIONARY IF NOT EXISTS "),
    ] {
        if let Some(rest) = ddl.strip_prefix(from) {
            if rest.starts_with("IF NOT EXISTS ") {
                break;
            }
            return format!("{to}{rest}");
        }
    }
    ddl.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::model::topology::{HostRuntime, ReconcileAttributes};

    fn host(replica_index: usize, replicas_in_shard: usize) -> Host {
        let name = format!("chi-demo-main-0-{replica_index}");
        Host {
            name,
            address: Address {
                namespace: "default".to_string(),
                chi_name: "demo".to_string(),
                cluster_name: "main".to_string(),
                cluster_index: 0,
                shard_name: "0".to_string(),
                shard_index: 0,
                replica_index,
            },
            replicas_in_shard,
            stopped: false,
            settings_digest: String::new(),
            attributes: Mutex::new(ReconcileAttributes::default()),
            runtime: Mutex::new(HostRuntime::default()),
        }
    }

    #[test]
    fn test_sibling_fqdn_picks_other_replica() {
        let sibling = ClickHouseSchemer::sibling_fqdn(&host(1, 2)).unwrap();
        assert_eq!(
            sibling,
            "chi-demo-main-0-0-0.chi-demo-main-0-0.default.svc"
        );
    }

    #[test]
    fn test_sibling_fqdn_none_for_lone_replica() {
        assert!(ClickHouseSchemer::sibling_fqdn(&host(0, 1)).is_none());
    }

    #[test]
    fn test_make_idempotent() {
        assert_eq!(
            make_idempotent("CREATE TABLE db.t (x Int32) ENGINE = Memory"),
            "CREATE TABLE IF NOT EXISTS db.t (x Int32) ENGINE = Memory"
        );
        assert_eq!(
            make_idempotent("CREATE MATERIALIZED VIEW db.v AS SELECT 1"),
            "CREATE MATERIALIZED VIEW IF NOT EXISTS db.v AS SELECT 1"
        );
        // Already idempotent DDL passes through unchanged.
        let ddl = "CREATE TABLE IF NOT EXISTS db.t (x Int32) ENGINE = Memory";
        assert_eq!(make_idempotent(ddl), ddl);
    }
}
