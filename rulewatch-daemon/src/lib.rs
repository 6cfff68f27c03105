//! # rulewatchd
//!
//! Runs one tenant supervisor process per tenant and wires the engine to
//! local backends:
//!
//! - **Jobs** are copied into a spool directory under a UUIDv7 job id
//! - **Commands** come from the static `[commands.*]` registry
//! - **Access** follows tenant owner and member lists
//! - **Workflow patterns** are JSON records in `patterns_home`

pub mod backends;
pub mod lifecycle;
pub mod logging;
pub mod signals;
