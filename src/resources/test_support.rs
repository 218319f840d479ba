//! Shared fixtures for resource builder tests.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{ClickHouseInstallation, ClickHouseInstallationSpec};
use crate::model::normalizer::normalize;
use crate::model::topology::Installation;
use crate::resources::common::OperatorInfo;

pub fn operator() -> OperatorInfo {
    OperatorInfo {
        version: "0.1.0".to_string(),
        commit: "abc1234".to_string(),
        build_date: "2026-07-01T12:30:00".to_string(),
    }
}

fn build(name: &str, spec_json: &str) -> Installation {
    let spec: ClickHouseInstallationSpec = serde_json::from_str(spec_json).unwrap();
    let cr = ClickHouseInstallation {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec,
        status: None,
    };
    let chi = normalize(&cr, None);
    // The fixture is the sole owner at this point.
    Arc::try_unwrap(chi).unwrap_or_else(|_| unreachable!("fixture installation is uniquely owned"))
}

/// One cluster named "main" with the given layout.
pub fn test_installation(name: &str, shards: usize, replicas: usize) -> Installation {
    build(
        name,
        &format!(
            r#"{{"clusters": [{{"name": "main", "layout": {{"shardsCount": {shards}, "replicasCount": {replicas}}}}}]}}"#
        ),
    )
}

pub fn test_installation_with_zk(name: &str, shards: usize, replicas: usize) -> Installation {
    build(
        name,
        &format!(
            r#"{{"clusters": [{{"name": "main",
                "zookeeper": {{"nodes": [{{"host": "zk-0.zoo"}}], "root": "/clickhouse/{name}"}},
                "layout": {{"shardsCount": {shards}, "replicasCount": {replicas}}}}}]}}"#
        ),
    )
}

pub fn test_stopped_installation(name: &str, shards: usize, replicas: usize) -> Installation {
    build(
        name,
        &format!(
            r#"{{"stopped": true, "clusters": [{{"name": "main", "layout": {{"shardsCount": {shards}, "replicasCount": {replicas}}}}}]}}"#
        ),
    )
}

pub fn test_installation_auto_secret(
    name: &str,
    shards: usize,
    replicas: usize,
) -> Installation {
    build(
        name,
        &format!(
            r#"{{"clusters": [{{"name": "main",
                "secret": {{"source": "auto"}},
                "layout": {{"shardsCount": {shards}, "replicasCount": {replicas}}}}}]}}"#
        ),
    )
}
