//! Mock infrastructure for simulating installation state in functional tests.
//!
//! Instead of duplicating production logic, these fixtures build raw
//! ClickHouseInstallation resources and feed them through the real
//! normalizer and action planner, so the tests stay in sync with production
//! behavior automatically.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use clickhouse_operator::crd::{ClickHouseInstallation, ClickHouseInstallationSpec};
use clickhouse_operator::model::normalizer::normalize;
use clickhouse_operator::model::topology::Installation;

/// A raw installation resource under construction.
#[derive(Clone)]
pub struct MockInstallation {
    pub name: String,
    pub generation: i64,
    pub stopped: bool,
    pub clusters: usize,
    pub shards: usize,
    pub replicas: usize,
    pub zookeeper_root: Option<String>,
}

impl MockInstallation {
    pub fn new(name: &str, shards: usize, replicas: usize) -> Self {
        Self {
            name: name.to_string(),
            generation: 1,
            stopped: false,
            clusters: 1,
            shards,
            replicas,
            zookeeper_root: None,
        }
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    pub fn stopped(mut self) -> Self {
        self.stopped = true;
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Use several identical clusters. A single cluster keeps the name
    /// "main"; multiple clusters are named "main0", "main1", ...
    pub fn clusters(mut self, clusters: usize) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn zookeeper(mut self, root: &str) -> Self {
        self.zookeeper_root = Some(root.to_string());
        self
    }

    /// The raw custom resource this mock describes.
    pub fn build_cr(&self) -> ClickHouseInstallation {
        let zookeeper = match &self.zookeeper_root {
            Some(root) => format!(
                r#""zookeeper": {{"nodes": [{{"host": "zk-0.zoo"}}], "root": "{root}"}},"#
            ),
            None => String::new(),
        };
        let cluster_entries: Vec<String> = (0..self.clusters.max(1))
            .map(|i| {
                let name = if self.clusters <= 1 {
                    "main".to_string()
                } else {
                    format!("main{i}")
                };
                format!(
                    r#"{{
                        "name": "{name}",
                        {zookeeper}
                        "layout": {{"shardsCount": {shards}, "replicasCount": {replicas}}}
                    }}"#,
                    shards = self.shards,
                    replicas = self.replicas,
                )
            })
            .collect();
        let spec_json = format!(
            r#"{{
                "stopped": {stopped},
                "clusters": [{clusters}]
            }}"#,
            stopped = self.stopped,
            clusters = cluster_entries.join(","),
        );
        let spec: ClickHouseInstallationSpec =
            serde_json::from_str(&spec_json).expect("mock spec must deserialize");

        ClickHouseInstallation {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some("default".to_string()),
                generation: Some(self.generation),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// Normalize this mock, optionally against a previous pass.
    pub fn normalize(&self, ancestor: Option<Arc<Installation>>) -> Arc<Installation> {
        normalize(&self.build_cr(), ancestor)
    }
}
