//! Swarmfs - a small distributed file system: a single metadata
//! coordinator, a pool of storage workers holding fixed-size chunks, and a
//! client library streaming file bytes to several replicas in parallel.

pub mod config;
pub mod coordinator;
pub mod metastore;
pub mod server;
pub mod time;
pub mod worker;
