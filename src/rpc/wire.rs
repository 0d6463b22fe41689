//! Wire message types and framing.

use crate::error::{Error, NetworkError, StoreError};
use crate::types::{
    ExecutorHeartbeatRequest, ExecutorHeartbeatResponse, GetShardOwnerRequest,
    GetShardOwnerResponse, NewEphemeralShardRequest, NewEphemeralShardResponse,
};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size on the wire.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Requests understood by a distributor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetShardOwner(GetShardOwnerRequest),
    NewEphemeralShard(NewEphemeralShardRequest),
    Heartbeat(ExecutorHeartbeatRequest),
}

/// Responses produced by a distributor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    ShardOwner(GetShardOwnerResponse),
    EphemeralShard(NewEphemeralShardResponse),
    Heartbeat(ExecutorHeartbeatResponse),
    Error(ErrorResponse),
}

/// Error classification carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
        }
    }
}

/// A typed error crossing the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&Error> for ErrorResponse {
    fn from(error: &Error) -> Self {
        let code = match error {
            Error::NamespaceNotFound { .. } => ErrorCode::NotFound,
            Error::Store(
                StoreError::ShardNotFound { .. } | StoreError::ExecutorNotFound { .. },
            ) => ErrorCode::NotFound,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Store(
                StoreError::VersionConflict(_)
                | StoreError::ShardAlreadyAssigned { .. }
                | StoreError::ExecutorNotRunning { .. },
            ) => ErrorCode::FailedPrecondition,
            Error::Unavailable(_) => ErrorCode::Unavailable,
            _ => ErrorCode::Internal,
        };
        Self {
            code,
            message: error.to_string(),
        }
    }
}

impl ErrorResponse {
    /// Reconstruct a client-side error.
    pub fn into_error(self) -> Error {
        Error::Remote {
            code: self.code.as_str().to_string(),
            message: self.message,
        }
    }
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), NetworkError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<BytesMut, NetworkError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge(len));
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Encode a wire message.
pub(crate) fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, NetworkError> {
    Ok(bincode::serialize(message)?)
}

/// Decode a wire message.
pub(crate) fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, NetworkError> {
    Ok(bincode::deserialize(payload)?)
}
