//! Zookeeper path management contract.
//!
//! Clusters with replicated tables need their Zookeeper root path to exist
//! before replicas register under it. A connection is opened per cluster
//! reconcile, the root is ensured, and the connection is closed again.
//! Failures are non-fatal: ClickHouse itself retries registration, so a
//! temporarily unreachable ensemble must not block the reconcile.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::controller::error::Result;
use crate::crd::ZookeeperSpec;
use crate::model::topology::Cluster;

/// An open session against a Zookeeper ensemble.
#[async_trait]
pub trait ZookeeperSession: Send {
    /// Create the path and its parents if absent.
    async fn ensure(&mut self, path: &str) -> Result<()>;

    /// Close the session.
    async fn close(self: Box<Self>);
}

/// Opens sessions against Zookeeper ensembles. The real implementation is
/// wired at startup; tests use mocks.
#[async_trait]
pub trait ZookeeperConnector: Send + Sync {
    async fn connect(&self, spec: &ZookeeperSpec) -> Result<Box<dyn ZookeeperSession>>;
}

/// Ensure the cluster's Zookeeper root path exists. Best-effort.
pub async fn reconcile_root_path(connector: Option<&dyn ZookeeperConnector>, cluster: &Cluster) {
    if cluster.zookeeper.is_empty() || cluster.zookeeper.root.is_empty() {
        // Nothing to reconcile
        return;
    }
    let Some(connector) = connector else {
        debug!(
            cluster = %cluster.name,
            "no Zookeeper connector configured, skipping root path ensure"
        );
        return;
    };

    match connector.connect(&cluster.zookeeper).await {
        Ok(mut session) => {
            if let Err(e) = session.ensure(&cluster.zookeeper.root).await {
                warn!(
                    cluster = %cluster.name,
                    root = %cluster.zookeeper.root,
                    error = %e,
                    "failed to ensure Zookeeper root path"
                );
            }
            session.close().await;
        }
        Err(e) => {
            warn!(
                cluster = %cluster.name,
                error = %e,
                "failed to connect to Zookeeper ensemble"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::crd::{ClusterSecretSource, ZookeeperNode};

    struct MockSession {
        ensured: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ZookeeperSession for MockSession {
        async fn ensure(&mut self, _path: &str) -> Result<()> {
            self.ensured.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(self: Box<Self>) {}
    }

    struct MockConnector {
        ensured: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ZookeeperConnector for MockConnector {
        async fn connect(&self, _spec: &ZookeeperSpec) -> Result<Box<dyn ZookeeperSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                ensured: self.ensured.clone(),
            }))
        }
    }

    fn cluster(zookeeper: ZookeeperSpec) -> Cluster {
        Cluster {
            name: "main".to_string(),
            index: 0,
            zookeeper,
            secret_source: ClusterSecretSource::None,
            secret_value: None,
            shards: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_root_path_ensured_once() {
        let ensured = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = MockConnector {
            ensured: ensured.clone(),
            connects: connects.clone(),
        };

        let cluster = cluster(ZookeeperSpec {
            nodes: vec![ZookeeperNode {
                host: "zk".to_string(),
                port: 2181,
            }],
            root: "/clickhouse/demo".to_string(),
        });

        reconcile_root_path(Some(&connector), &cluster).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(ensured.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_zookeeper_is_skipped() {
        let ensured = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = MockConnector {
            ensured: ensured.clone(),
            connects: connects.clone(),
        };

        reconcile_root_path(Some(&connector), &cluster(ZookeeperSpec::default())).await;
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }
}
