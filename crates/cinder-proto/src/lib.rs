//! Generated gRPC bindings for the `KeyValueStore` service.
//!
//! Both the server facade and the client-side shard router build on
//! these types, so they live in their own crate rather than being
//! embedded in either binary.

pub mod proto {
    tonic::include_proto!("kvstore.v1");
}

pub use proto::*;
