//! Network transport for Raft RPCs.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON-encoded
//! [`RpcRequest`] / [`RpcResponse`] envelope over TCP. Wire compatibility
//! between versions is not a goal.
//!
//! The client keeps one cached connection per peer and reconnects on
//! failure; every call is bounded by [`RPC_TIMEOUT`] so a dead peer costs
//! at most one timeout per round. Transport failures are non-fatal: the
//! node treats them as "no reply" and retries on the next heartbeat tick.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{RPC_CONNECT_TIMEOUT, RPC_TIMEOUT};
use crate::error::{Error, Result};

use super::node::RaftNode;
use super::types::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, RpcRequest,
    RpcResponse,
};

/// Upper bound on a single RPC frame; a peer announcing more is corrupt.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

struct ClientInner {
    addr: String,
    cached: tokio::sync::Mutex<Option<TcpStream>>,
}

/// RPC client for one remote Raft node.
#[derive(Clone)]
pub struct PeerClient {
    inner: Arc<ClientInner>,
}

impl PeerClient {
    /// Create a client for `addr`. No connection is made until the first
    /// call.
    pub fn new(addr: String) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                addr,
                cached: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Send RequestVote and await the peer's decision.
    pub async fn request_vote(&self, args: &RequestVoteArgs) -> Result<RequestVoteReply> {
        match self.call(&RpcRequest::RequestVote(args.clone())).await? {
            RpcResponse::RequestVote(reply) => Ok(reply),
            RpcResponse::Error(e) => Err(Error::Transport(e)),
            other => Err(Error::Transport(format!(
                "unexpected response to RequestVote: {other:?}"
            ))),
        }
    }

    /// Send AppendEntries (replication or heartbeat) and await the reply.
    pub async fn append_entries(&self, args: &AppendEntriesArgs) -> Result<AppendEntriesReply> {
        match self.call(&RpcRequest::AppendEntries(args.clone())).await? {
            RpcResponse::AppendEntries(reply) => Ok(reply),
            RpcResponse::Error(e) => Err(Error::Transport(e)),
            other => Err(Error::Transport(format!(
                "unexpected response to AppendEntries: {other:?}"
            ))),
        }
    }

    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let payload = serde_json::to_vec(request)?;

        let mut guard = self.inner.cached.lock().await;

        // Reuse the cached connection if the peer still honors it.
        if let Some(stream) = guard.as_mut() {
            match Self::exchange(stream, &payload).await {
                Ok(response) => return Ok(response),
                Err(_) => {
                    *guard = None;
                }
            }
        }

        let mut stream = timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(&self.inner.addr))
            .await
            .map_err(|_| Error::Transport(format!("connect timeout to {}", self.inner.addr)))?
            .map_err(|e| Error::Transport(format!("connect to {}: {e}", self.inner.addr)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Transport(e.to_string()))?;

        let response = Self::exchange(&mut stream, &payload).await?;
        *guard = Some(stream);
        Ok(response)
    }

    async fn exchange(stream: &mut TcpStream, payload: &[u8]) -> Result<RpcResponse> {
        let exchange = async {
            write_frame(stream, payload).await?;
            read_frame(stream).await
        };
        let raw = timeout(RPC_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::Transport("rpc timed out".to_string()))?
            .map_err(|e| Error::Transport(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| Error::Transport(format!("decode reply: {e}")))
    }
}

/// Server side of the peer transport: accepts connections and dispatches
/// decoded requests into the local node's handlers. Ordering is disciplined
/// by the node's mutex, so concurrent connections are safe.
pub struct RaftRpcServer {
    node: Arc<RaftNode>,
    listener: TcpListener,
}

impl RaftRpcServer {
    /// Bind the RPC listener on `addr`.
    pub async fn bind(node: Arc<RaftNode>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(node_id = %node.id(), addr = %addr, "raft rpc server listening");
        Ok(Self { node, listener })
    }

    /// Wrap an already bound listener (used by tests that need the port
    /// before the node exists).
    pub fn from_listener(node: Arc<RaftNode>, listener: TcpListener) -> Self {
        Self { node, listener }
    }

    /// Address the server is actually bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept loop. Runs until the node shuts down.
    pub fn spawn(self) {
        tokio::spawn(async move { self.run().await });
    }

    async fn run(self) {
        let mut shutdown_rx = self.node.subscribe_shutdown();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(node_id = %self.node.id(), "raft rpc server shutting down");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let node = Arc::clone(&self.node);
                            let shutdown = self.node.subscribe_shutdown();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(node, stream, shutdown).await {
                                    debug!(peer = %peer_addr, error = %e, "rpc connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept rpc connection");
                        }
                    }
                }
            }
        }
    }
}

/// Serve frames from one peer connection until it closes.
async fn serve_connection(
    node: Arc<RaftNode>,
    mut stream: TcpStream,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    loop {
        let raw = tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            raw = read_frame(&mut stream) => raw?,
        };

        let response = match serde_json::from_slice::<RpcRequest>(&raw) {
            Ok(RpcRequest::RequestVote(args)) => {
                RpcResponse::RequestVote(node.handle_request_vote(&args))
            }
            Ok(RpcRequest::AppendEntries(args)) => {
                RpcResponse::AppendEntries(node.handle_append_entries(&args))
            }
            Err(e) => RpcResponse::Error(format!("malformed request: {e}")),
        };

        let payload = serde_json::to_vec(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_frame(&mut stream, &payload).await?;
    }
}
