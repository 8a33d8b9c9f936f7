//! gRPC facade over the storage engine.
//!
//! Validates inputs at the edge (empty keys, non-positive TTLs, unknown
//! replication command types are INVALID_ARGUMENT) and otherwise
//! delegates straight to [`Storage`]. The same facade serves masters
//! and replicas; `ReplicateCommand` applies mutations through the
//! `*_from_replication` paths, which skip the local journal and never
//! fan out further.

use std::sync::Arc;

use cinder_core::Storage;
use cinder_proto::key_value_store_server::KeyValueStore;
use cinder_proto::replication_command::CommandType;
use cinder_proto::{
    ContainsRequest, ContainsResponse, DeleteRequest, DeleteResponse, ExpireRequest,
    ExpireResponse, GetRequest, GetResponse, ReplicationCommand, ReplicationResponse,
    ReplicationStreamRequest, SetRequest, SetResponse, TtlRequest, TtlResponse,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

/// The `KeyValueStore` service implementation.
pub struct KvService {
    storage: Arc<Storage>,
}

impl KvService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[allow(clippy::result_large_err)] // Status is tonic's idiomatic error type
fn validate_key(key: &str) -> Result<(), Status> {
    if key.is_empty() {
        return Err(Status::invalid_argument("key must not be empty"));
    }
    Ok(())
}

#[tonic::async_trait]
impl KeyValueStore for KvService {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        validate_key(&req.key)?;

        let response = match self.storage.get(&req.key) {
            Some(value) => GetResponse { found: true, value },
            None => GetResponse {
                found: false,
                value: String::new(),
            },
        };
        Ok(Response::new(response))
    }

    async fn set(&self, request: Request<SetRequest>) -> Result<Response<SetResponse>, Status> {
        let req = request.into_inner();
        validate_key(&req.key)?;

        self.storage.set(&req.key, &req.value);
        Ok(Response::new(SetResponse { success: true }))
    }

    async fn contains(
        &self,
        request: Request<ContainsRequest>,
    ) -> Result<Response<ContainsResponse>, Status> {
        let req = request.into_inner();
        validate_key(&req.key)?;

        let exists = self.storage.contains(&req.key);
        Ok(Response::new(ContainsResponse { exists }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        validate_key(&req.key)?;

        let found = self.storage.delete(&req.key);
        Ok(Response::new(DeleteResponse {
            success: true,
            found,
        }))
    }

    async fn expire(
        &self,
        request: Request<ExpireRequest>,
    ) -> Result<Response<ExpireResponse>, Status> {
        let req = request.into_inner();
        validate_key(&req.key)?;
        if req.seconds <= 0 {
            return Err(Status::invalid_argument("seconds must be positive"));
        }

        let success = self.storage.expire(&req.key, req.seconds);
        Ok(Response::new(ExpireResponse { success }))
    }

    async fn ttl(&self, request: Request<TtlRequest>) -> Result<Response<TtlResponse>, Status> {
        let req = request.into_inner();
        validate_key(&req.key)?;

        let seconds = self.storage.ttl(&req.key);
        Ok(Response::new(TtlResponse { seconds }))
    }

    async fn replicate_command(
        &self,
        request: Request<ReplicationCommand>,
    ) -> Result<Response<ReplicationResponse>, Status> {
        let cmd = request.into_inner();
        match CommandType::try_from(cmd.r#type) {
            Ok(CommandType::Set) => {
                self.storage.set_from_replication(&cmd.key, &cmd.value);
            }
            Ok(CommandType::Delete) => {
                self.storage.delete_from_replication(&cmd.key);
            }
            Ok(CommandType::Expire) => {
                self.storage.expire_from_replication(&cmd.key, cmd.seconds);
            }
            Err(_) => {
                return Err(Status::invalid_argument(
                    "unknown replication command type",
                ));
            }
        }
        debug!(sequence_id = cmd.sequence_id, key = %cmd.key, "replicated command applied");

        Ok(Response::new(ReplicationResponse {
            success: true,
            last_applied_sequence: cmd.sequence_id,
        }))
    }

    type StreamReplicationStream = ReceiverStream<Result<ReplicationCommand, Status>>;

    async fn stream_replication(
        &self,
        _request: Request<ReplicationStreamRequest>,
    ) -> Result<Response<Self::StreamReplicationStream>, Status> {
        Err(Status::unimplemented(
            "streaming replication is not implemented",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> KvService {
        KvService::new(Arc::new(Storage::in_memory()))
    }

    #[tokio::test]
    async fn set_then_get_round_trip() {
        let svc = service();

        let set = svc
            .set(Request::new(SetRequest {
                key: "name".into(),
                value: "Alice".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(set.success);

        let get = svc
            .get(Request::new(GetRequest { key: "name".into() }))
            .await
            .unwrap()
            .into_inner();
        assert!(get.found);
        assert_eq!(get.value, "Alice");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let svc = service();
        let get = svc
            .get(Request::new(GetRequest {
                key: "ghost".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!get.found);
        assert!(get.value.is_empty());
    }

    #[tokio::test]
    async fn empty_keys_are_rejected_everywhere() {
        let svc = service();
        let empty = String::new;

        let status = svc
            .get(Request::new(GetRequest { key: empty() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = svc
            .set(Request::new(SetRequest {
                key: empty(),
                value: "v".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = svc
            .contains(Request::new(ContainsRequest { key: empty() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = svc
            .delete(Request::new(DeleteRequest { key: empty() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = svc
            .ttl(Request::new(TtlRequest { key: empty() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn non_positive_expire_is_rejected() {
        let svc = service();
        for seconds in [0, -1] {
            let status = svc
                .expire(Request::new(ExpireRequest {
                    key: "k".into(),
                    seconds,
                }))
                .await
                .unwrap_err();
            assert_eq!(status.code(), tonic::Code::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn expire_on_missing_key_reports_failure() {
        let svc = service();
        let resp = svc
            .expire(Request::new(ExpireRequest {
                key: "ghost".into(),
                seconds: 10,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn delete_reports_found_flag() {
        let svc = service();
        svc.set(Request::new(SetRequest {
            key: "k".into(),
            value: "v".into(),
        }))
        .await
        .unwrap();

        let first = svc
            .delete(Request::new(DeleteRequest { key: "k".into() }))
            .await
            .unwrap()
            .into_inner();
        assert!(first.success && first.found);

        let second = svc
            .delete(Request::new(DeleteRequest { key: "k".into() }))
            .await
            .unwrap()
            .into_inner();
        assert!(second.success && !second.found);
    }

    #[tokio::test]
    async fn ttl_markers_through_the_facade() {
        let svc = service();

        let resp = svc
            .ttl(Request::new(TtlRequest {
                key: "ghost".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.seconds, -2);

        svc.set(Request::new(SetRequest {
            key: "k".into(),
            value: "v".into(),
        }))
        .await
        .unwrap();

        let resp = svc
            .ttl(Request::new(TtlRequest { key: "k".into() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.seconds, -1);
    }

    #[tokio::test]
    async fn replicated_commands_are_applied() {
        let svc = service();

        let resp = svc
            .replicate_command(Request::new(ReplicationCommand {
                r#type: CommandType::Set as i32,
                key: "a".into(),
                value: "1".into(),
                seconds: 0,
                sequence_id: 7,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.success);
        assert_eq!(resp.last_applied_sequence, 7);

        let get = svc
            .get(Request::new(GetRequest { key: "a".into() }))
            .await
            .unwrap()
            .into_inner();
        assert!(get.found);
        assert_eq!(get.value, "1");
    }

    #[tokio::test]
    async fn unknown_replication_type_is_rejected() {
        let svc = service();
        let status = svc
            .replicate_command(Request::new(ReplicationCommand {
                r#type: 42,
                key: "a".into(),
                value: String::new(),
                seconds: 0,
                sequence_id: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn stream_replication_is_unimplemented() {
        let svc = service();
        let status = svc
            .stream_replication(Request::new(ReplicationStreamRequest { from_sequence: 0 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }
}
