//! Custom Resource Definitions (CRDs) for clickhouse-operator.
//!
//! - `ClickHouseInstallation`: the declarative CHI resource driving the
//!   reconciliation pipeline.

mod installation;

pub use installation::*;
