//! Streaming aggregation core of an APM collector.
//!
//! Records enter per-kind pipeline graphs, are routed to the node owning
//! their key, merged into in-memory windows and periodically persisted with
//! a read-merge-write against storage.

pub mod cluster;
pub mod config;
pub mod export;
pub mod model;
pub mod node;
pub mod pipeline;
pub mod remote;
pub mod storage;
pub mod worker;
