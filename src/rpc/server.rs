//! TCP server for the distributor RPC surface.

use super::wire::{self, Request, Response};
use super::{DistributorService, ShardDistributorApi, ShardDistributorExecutorApi};
use crate::error::{NetworkError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP server serving both distributor services.
pub struct DistributorServer {
    listener: TcpListener,
    service: Arc<dyn DistributorService>,
    shutdown: CancellationToken,
    active_connections: Arc<AtomicUsize>,
}

impl DistributorServer {
    /// Bind the server. Use `local_addr` to discover the bound port.
    pub async fn bind(addr: SocketAddr, service: Arc<dyn DistributorService>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(NetworkError::Io)?;
        Ok(Self {
            listener,
            service,
            shutdown: CancellationToken::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Token that stops the accept loop and drains connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "distributor server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "accepted connection");
                            let service = self.service.clone();
                            let cancel = self.shutdown.clone();
                            let active = self.active_connections.clone();
                            active.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                let result =
                                    Self::handle_connection(stream, service, cancel).await;
                                active.fetch_sub(1, Ordering::SeqCst);
                                if let Err(e) = result {
                                    debug!(error = %e, "connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(
                        active = self.active_connections.load(Ordering::SeqCst),
                        "distributor server shutting down"
                    );
                    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
                    while self.active_connections.load(Ordering::SeqCst) > 0 {
                        if tokio::time::Instant::now() > deadline {
                            warn!(
                                active = self.active_connections.load(Ordering::SeqCst),
                                "shutdown timeout, dropping remaining connections"
                            );
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        service: Arc<dyn DistributorService>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = wire::read_frame(&mut stream) => match frame {
                    Ok(frame) => frame,
                    Err(NetworkError::ConnectionClosed) => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
            };

            let request: Request = wire::decode(&frame)?;
            let response = Self::dispatch(&service, request).await;
            let payload = wire::encode(&response)?;
            wire::write_frame(&mut stream, &payload).await?;
        }
    }

    async fn dispatch(service: &Arc<dyn DistributorService>, request: Request) -> Response {
        match request {
            Request::GetShardOwner(req) => match service.get_shard_owner(req).await {
                Ok(resp) => Response::ShardOwner(resp),
                Err(e) => Response::Error((&e).into()),
            },
            Request::NewEphemeralShard(req) => match service.new_ephemeral_shard(req).await {
                Ok(resp) => Response::EphemeralShard(resp),
                Err(e) => Response::Error((&e).into()),
            },
            Request::Heartbeat(req) => match service.heartbeat(req).await {
                Ok(resp) => Response::Heartbeat(resp),
                Err(e) => Response::Error((&e).into()),
            },
        }
    }
}
