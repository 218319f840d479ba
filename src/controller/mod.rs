//! Controller module for clickhouse-operator.
//!
//! Contains the reconciliation pipeline: the kube-rs entry point, the
//! top-level installation reconciler, the per-host state machine, the
//! per-object reconcilers, and the contracts toward ClickHouse and
//! Zookeeper.

pub mod chi;
pub mod context;
pub mod error;
pub mod host;
pub mod kube;
pub mod labeler;
pub mod objects;
pub mod poller;
pub mod reconciler;
pub mod schemer;
pub mod statefulset;
pub mod storage;
pub mod task;
pub mod zookeeper;
