//! Server-side building blocks: the gRPC facade and the replication
//! manager. The binary in `main.rs` wires these to the storage engine;
//! the integration tests boot them in-process.

pub mod replication;
pub mod service;
