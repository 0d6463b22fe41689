//! TCP client for the distributor RPC surface.

use super::wire::{self, Request, Response};
use super::{ShardDistributorApi, ShardDistributorExecutorApi};
use crate::error::{Error, NetworkError, Result};
use crate::types::{
    ExecutorHeartbeatRequest, ExecutorHeartbeatResponse, GetShardOwnerRequest,
    GetShardOwnerResponse, NewEphemeralShardRequest, NewEphemeralShardResponse,
};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// RPC client for a remote distributor. Keeps one connection and
/// reconnects once per call on failure. Timeouts are the caller's
/// concern: wrap calls in `tokio::time::timeout` as needed.
pub struct RpcClient {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl RpcClient {
    /// Create a client for the given `host:port` address. Connects
    /// lazily on first use.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;

        let mut last_error = None;
        for attempt in 0..2 {
            if conn.is_none() {
                debug!(addr = %self.addr, attempt, "connecting to distributor");
                *conn = Some(
                    TcpStream::connect(&self.addr)
                        .await
                        .map_err(NetworkError::Io)?,
                );
            }
            let stream = conn.as_mut().unwrap();
            match Self::roundtrip(stream, &request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    // Stale connection; drop it and retry once.
                    *conn = None;
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(NetworkError::ConnectionClosed).into())
    }

    async fn roundtrip(
        stream: &mut TcpStream,
        request: &Request,
    ) -> std::result::Result<Response, NetworkError> {
        let payload = wire::encode(request)?;
        wire::write_frame(stream, &payload).await?;
        let frame = wire::read_frame(stream).await?;
        wire::decode(&frame)
    }

    fn unexpected(response: Response) -> Error {
        match response {
            Response::Error(error) => error.into_error(),
            _ => NetworkError::UnexpectedResponse.into(),
        }
    }
}

#[async_trait]
impl ShardDistributorApi for RpcClient {
    async fn get_shard_owner(&self, request: GetShardOwnerRequest) -> Result<GetShardOwnerResponse> {
        match self.call(Request::GetShardOwner(request)).await? {
            Response::ShardOwner(resp) => Ok(resp),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn new_ephemeral_shard(
        &self,
        request: NewEphemeralShardRequest,
    ) -> Result<NewEphemeralShardResponse> {
        match self.call(Request::NewEphemeralShard(request)).await? {
            Response::EphemeralShard(resp) => Ok(resp),
            other => Err(Self::unexpected(other)),
        }
    }
}

#[async_trait]
impl ShardDistributorExecutorApi for RpcClient {
    async fn heartbeat(
        &self,
        request: ExecutorHeartbeatRequest,
    ) -> Result<ExecutorHeartbeatResponse> {
        match self.call(Request::Heartbeat(request)).await? {
            Response::Heartbeat(resp) => Ok(resp),
            other => Err(Self::unexpected(other)),
        }
    }
}
