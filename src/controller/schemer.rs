//! ClickHouse schemer contract.
//!
//! The schemer is the only component that talks SQL to live ClickHouse
//! hosts. The reconciliation core consumes it through this trait; the real
//! implementation lives with the deployment wiring, tests use mocks.

use async_trait::async_trait;
use semver::Version;

use crate::controller::error::Result;
use crate::model::topology::Host;

/// Literal returned to callers when the version query fails; kept for log
/// and event messages.
pub const UNKNOWN_VERSION: &str = "failed to query";

/// Options for table migration.
#[derive(Clone, Copy, Debug, Default)]
pub struct MigrateTableOptions {
    /// Migrate even when the host looks up to date.
    pub force_migrate: bool,
    /// Drop the replica's replication metadata before migrating. Set after
    /// data loss, where stale Zookeeper state would block re-replication.
    pub drop_replica: bool,
}

/// SQL-side operations against live ClickHouse hosts.
#[async_trait]
pub trait Schemer: Send + Sync {
    /// Query `select version()` on the host.
    async fn host_clickhouse_version(&self, host: &Host) -> Result<String>;

    /// Create/replicate schema objects on the host.
    async fn migrate_tables(&self, host: &Host, options: &MigrateTableOptions) -> Result<()>;

    /// Number of queries currently executing on the host, the drain
    /// predicate after exclusion.
    async fn active_queries_count(&self, host: &Host) -> Result<usize>;

    /// Drop the replica's metadata from the coordination layer. Used for
    /// hosts removed by the action plan.
    async fn drop_replica(&self, host: &Host) -> Result<()>;
}

/// Which hosts a version probe should skip.
#[derive(Clone, Copy, Debug, Default)]
pub struct VersionOptions {
    pub skip_new: bool,
    pub skip_stopped: bool,
    pub skip_stopped_ancestor: bool,
}

impl VersionOptions {
    /// Returns the skip reason when the probe does not apply to this host.
    pub fn should_skip(&self, host: &Host, ancestor_stopped: bool) -> Option<&'static str> {
        if self.skip_new && host.is_new() {
            return Some("host is a new one, version is not applicable");
        }
        if self.skip_stopped && host.is_stopped() {
            return Some("host is stopped, version is not applicable");
        }
        if self.skip_stopped_ancestor && ancestor_stopped {
            return Some("host ancestor is stopped, version is not applicable");
        }
        None
    }
}

/// Parse a ClickHouse version string leniently.
///
/// ClickHouse reports four components ("24.8.2.3"); semver carries three, so
/// the build component is dropped.
pub fn parse_software_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let core: Vec<&str> = trimmed.split('.').take(3).collect();
    if core.len() < 3 {
        return None;
    }
    Version::parse(&core.join(".")).ok()
}

/// Record a successfully probed version on the host runtime.
pub fn record_host_version(host: &Host, raw: &str) {
    let parsed = parse_software_version(raw);
    host.with_runtime(|r| r.version = parsed);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::model::topology::{Address, HostRuntime, ReconcileAttributes};

    fn host(new: bool, stopped: bool) -> Host {
        let host = Host {
            name: "chi-demo-main-0-0".to_string(),
            address: Address {
                namespace: "default".to_string(),
                chi_name: "demo".to_string(),
                cluster_name: "main".to_string(),
                cluster_index: 0,
                shard_name: "0".to_string(),
                shard_index: 0,
                replica_index: 0,
            },
            replicas_in_shard: 1,
            stopped,
            settings_digest: String::new(),
            attributes: Mutex::new(ReconcileAttributes::default()),
            runtime: Mutex::new(HostRuntime::default()),
        };
        if new {
            host.with_attributes(|a| a.set_new());
        }
        host
    }

    #[test]
    fn test_version_options_skip_table() {
        let opts = VersionOptions {
            skip_new: true,
            skip_stopped_ancestor: true,
            ..Default::default()
        };

        // New host skipped.
        assert!(opts.should_skip(&host(true, false), false).is_some());
        // Existing host with running ancestor probed.
        assert!(opts.should_skip(&host(false, false), false).is_none());
        // Stopped ancestor skipped.
        assert!(opts.should_skip(&host(false, false), true).is_some());
        // skip_stopped not set: stopped host still probed.
        assert!(opts.should_skip(&host(false, true), false).is_none());

        let opts = VersionOptions {
            skip_stopped: true,
            ..Default::default()
        };
        assert!(opts.should_skip(&host(false, true), false).is_some());
    }

    #[test]
    fn test_parse_software_version() {
        let v = parse_software_version("24.8.2.3").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (24, 8, 2));

        let v = parse_software_version("23.3.1").unwrap();
        assert_eq!(v.major, 23);

        assert!(parse_software_version("24.8").is_none());
        assert!(parse_software_version("not-a-version").is_none());
    }

    #[test]
    fn test_record_host_version() {
        let host = host(false, false);
        record_host_version(&host, "24.8.2.3");
        let version = host.with_runtime(|r| r.version.clone()).unwrap();
        assert_eq!(version.major, 24);
    }
}
