//! Client-side request routing: shard key → owning executor → network
//! peer.
//!
//! The chooser sits in the outbound RPC path. A request annotated with a
//! shard key and a namespace header is resolved through the shard cache
//! to the owning executor, whose advertised `grpc_address` metadata
//! names the peer to connect to. Peers are retained once per address and
//! reused across requests.

use crate::cache::ShardToExecutorCache;
use crate::error::{Error, Result, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Header naming the namespace a routed request belongs to.
pub const NAMESPACE_HEADER: &str = "x-shard-distributor-namespace";

/// Metadata key under which executors advertise their address.
pub const METADATA_GRPC_ADDRESS: &str = "grpc_address";

/// A retained network peer.
pub trait Peer: Send + Sync + 'static {
    /// The peer's identifier, its network address.
    fn identifier(&self) -> &str;
}

/// Transport that retains and releases peers by address.
pub trait PeerTransport: Send + Sync + 'static {
    fn retain_peer(&self, address: &str) -> Result<Arc<dyn Peer>>;
    fn release_peer(&self, peer: Arc<dyn Peer>) -> Result<()>;
}

/// An outbound request to be routed.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// The application shard key, not an address.
    pub shard_key: String,

    /// Request headers; must carry [`NAMESPACE_HEADER`].
    pub headers: HashMap<String, String>,
}

impl RouteRequest {
    /// Build a request for a shard in a namespace.
    pub fn new(namespace: impl Into<String>, shard_key: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert(NAMESPACE_HEADER.to_string(), namespace.into());
        Self {
            shard_key: shard_key.into(),
            headers,
        }
    }
}

/// Callback handed back with every chosen peer; invoked when the call
/// finishes. Currently a no-op.
pub type OnFinish = Box<dyn FnOnce() + Send>;

/// Routes requests to the executor owning their shard.
pub struct ShardRouteChooser {
    cache: Arc<ShardToExecutorCache>,
    transport: Arc<dyn PeerTransport>,
    peers: RwLock<HashMap<String, Arc<dyn Peer>>>,
}

impl ShardRouteChooser {
    pub fn new(cache: Arc<ShardToExecutorCache>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            cache,
            transport,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a request to a peer.
    ///
    /// Rejects requests without a shard key or namespace header; a shard
    /// without a known owner is unavailable (retryable); an owner without
    /// an advertised address is an internal error.
    pub async fn choose(&self, request: &RouteRequest) -> Result<(Arc<dyn Peer>, OnFinish)> {
        if request.shard_key.is_empty() {
            return Err(Error::InvalidArgument(
                "chooser requires a non-empty shard key".to_string(),
            ));
        }
        let namespace = request
            .headers
            .get(NAMESPACE_HEADER)
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "chooser requires the {NAMESPACE_HEADER} header to be non-empty"
                ))
            })?;

        let owner = match self
            .cache
            .get_shard_owner(namespace, &request.shard_key)
            .await
        {
            Ok(owner) => owner,
            Err(StoreError::ShardNotFound { .. }) => {
                return Err(Error::Unavailable(format!(
                    "no owner for shard {} in namespace {namespace}",
                    request.shard_key
                )))
            }
            Err(e) => {
                return Err(Error::Unavailable(format!(
                    "resolving owner for shard {}: {e}",
                    request.shard_key
                )))
            }
        };

        let address = owner
            .metadata
            .get(METADATA_GRPC_ADDRESS)
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| {
                Error::Internal(format!(
                    "no {METADATA_GRPC_ADDRESS} in metadata for executor {} owning shard {}",
                    owner.executor_id, request.shard_key
                ))
            })?;

        let peer = self.peer_for(address)?;
        Ok((peer, Box::new(|| {})))
    }

    fn peer_for(&self, address: &str) -> Result<Arc<dyn Peer>> {
        if let Some(peer) = self.peers.read().get(address) {
            return Ok(peer.clone());
        }

        let mut peers = self.peers.write();
        // Another caller may have retained it while we upgraded the lock.
        if let Some(peer) = peers.get(address) {
            return Ok(peer.clone());
        }
        let peer = self.transport.retain_peer(address)?;
        peers.insert(address.to_string(), peer.clone());
        info!(address, "retained routing peer");
        Ok(peer)
    }

    /// Release every retained peer.
    pub fn stop(&self) {
        let mut peers = self.peers.write();
        for (address, peer) in peers.drain() {
            if let Err(e) = self.transport.release_peer(peer) {
                error!(address = %address, error = %e, "failed to release peer");
            }
        }
    }

    /// Number of currently retained peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_request_builder() {
        let request = RouteRequest::new("ns", "k");
        assert_eq!(request.shard_key, "k");
        assert_eq!(request.headers[NAMESPACE_HEADER], "ns");
    }
}
