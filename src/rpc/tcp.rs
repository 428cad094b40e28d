//! TCP transport for shard RPCs.
//!
//! Requests and responses travel in length-delimited frames and carry a
//! call id. One request is in flight per connection. The connection is
//! checked out for the duration of a call, so an abandoned call takes its
//! connection with it and the next call dials afresh. Failed calls are
//! never retried.

use crate::config::ClientConfig;
use crate::core::{Error, Gradient, Parameter, ParameterWithConfig, Result, Server};
use crate::rpc::codec::{
    decode_payload, encode_payload, framed, Envelope, Request, Response, WireError,
};
use crate::rpc::service::{Connector, PserverRpc};
use crate::server::ParameterServer;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Bind the server's configured listen address and serve in the background.
///
/// Returns the bound address (useful with port 0).
pub async fn spawn(server: Arc<ParameterServer>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(&server.config().listen_addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "parameter server listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, server).await {
            warn!("parameter server stopped: {}", e);
        }
    });
    Ok((addr, handle))
}

/// Accept connections forever.
pub async fn serve(listener: TcpListener, server: Arc<ParameterServer>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            debug!(%peer, "connection accepted");
            if let Err(e) = handle_connection(stream, &server).await {
                warn!(%peer, "connection closed with error: {}", e);
            } else {
                debug!(%peer, "connection closed");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, server: &ParameterServer) -> Result<()> {
    stream.set_nodelay(true)?;
    let threshold = server.config().compression_threshold;
    let mut conn = framed(stream);

    while let Some(frame) = conn.next().await {
        let call: Envelope<Request> = decode_payload(&frame?)?;
        let response = dispatch(server, call.message).await;
        let reply = Envelope {
            id: call.id,
            message: response,
        };
        conn.send(encode_payload(&reply, threshold)?).await?;
    }
    Ok(())
}

/// Execute one request against a local server.
pub async fn dispatch(server: &ParameterServer, request: Request) -> Response {
    let result = match request {
        Request::InitParam(pwc) => server.init_param(pwc).await.map(|_| Response::Done),
        Request::FinishInitParams => server.finish_init_params().await.map(|_| Response::Done),
        Request::SendGrads(grads) => server.send_grads(&grads).await.map(|_| Response::Done),
        Request::GetParams(names) => server.get_params(&names).await.map(Response::Params),
        Request::IsReady => Ok(Response::Ready(server.is_ready().await)),
    };

    result.unwrap_or_else(|e| Response::Failed(WireError::from(&e)))
}

/// RPC handle to a remote parameter server.
pub struct TcpPserverClient {
    server: Server,
    /// Idle connection; empty while a call holds it or after a failure
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    config: ClientConfig,
}

impl TcpPserverClient {
    /// Connect to `server`.
    pub async fn connect(server: &Server, config: &ClientConfig) -> Result<Self> {
        let conn = Self::dial(server, config).await?;
        Ok(Self {
            server: server.clone(),
            conn: Mutex::new(Some(conn)),
            next_id: AtomicU64::new(0),
            config: config.clone(),
        })
    }

    async fn dial(server: &Server, config: &ClientConfig) -> Result<Connection> {
        let stream = tokio::time::timeout(config.rpc_timeout(), TcpStream::connect(&server.addr))
            .await
            .map_err(|_| Error::shard_rpc(server.index, format!("connect to {} timed out", server.addr)))?
            .map_err(|e| Error::shard_rpc(server.index, format!("connect to {}: {}", server.addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::shard_rpc(server.index, e))?;
        Ok(framed(stream))
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let method = request.method();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = encode_payload(
            &Envelope {
                id,
                message: request,
            },
            self.config.compression_threshold,
        )?;

        let mut slot = self.conn.lock().await;
        let idle = slot.take();
        let outcome =
            tokio::time::timeout(self.config.rpc_timeout(), self.exchange(idle, id, payload)).await;

        match outcome {
            Ok(Ok((conn, response))) => {
                *slot = Some(conn);
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(shard = self.server.index, method, "rpc failed: {}", e);
                match e {
                    Error::ShardRpc { .. } => Err(e),
                    other => Err(Error::shard_rpc(self.server.index, other)),
                }
            }
            Err(_) => {
                warn!(shard = self.server.index, method, "rpc timed out");
                Err(Error::shard_rpc(
                    self.server.index,
                    format!("{} timed out", method),
                ))
            }
        }
    }

    /// Send one request and wait for the response carrying the same id.
    async fn exchange(
        &self,
        idle: Option<Connection>,
        id: u64,
        payload: Bytes,
    ) -> Result<(Connection, Response)> {
        let mut conn = match idle {
            Some(conn) => conn,
            None => Self::dial(&self.server, &self.config).await?,
        };

        conn.send(payload).await?;
        loop {
            let frame = conn
                .next()
                .await
                .ok_or_else(|| Error::Internal("server closed connection".into()))??;
            let reply: Envelope<Response> = decode_payload(&frame)?;
            if reply.id == id {
                return Ok((conn, reply.message));
            }
            debug!(shard = self.server.index, expected = id, got = reply.id, "discarding stale response");
        }
    }

    fn unexpected(&self, response: Response) -> Error {
        Error::shard_rpc(
            self.server.index,
            format!("unexpected response: {:?}", response),
        )
    }

    async fn call_done(&self, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Done => Ok(()),
            Response::Failed(e) => Err(e.into()),
            other => Err(self.unexpected(other)),
        }
    }
}

#[async_trait]
impl PserverRpc for TcpPserverClient {
    async fn init_param(&self, param: ParameterWithConfig) -> Result<()> {
        self.call_done(Request::InitParam(param)).await
    }

    async fn finish_init_params(&self) -> Result<()> {
        self.call_done(Request::FinishInitParams).await
    }

    async fn send_grads(&self, grads: Vec<Gradient>) -> Result<()> {
        self.call_done(Request::SendGrads(grads)).await
    }

    async fn get_params(&self, names: Vec<String>) -> Result<Vec<Parameter>> {
        match self.call(Request::GetParams(names)).await? {
            Response::Params(params) => Ok(params),
            Response::Failed(e) => Err(e.into()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn is_ready(&self) -> Result<bool> {
        match self.call(Request::IsReady).await? {
            Response::Ready(ready) => Ok(ready),
            Response::Failed(e) => Err(e.into()),
            other => Err(self.unexpected(other)),
        }
    }
}

/// Connector opening TCP connections.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    config: ClientConfig,
}

impl TcpConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn PserverRpc>> {
        let client = TcpPserverClient::connect(server, &self.config).await?;
        debug!(shard = server.index, addr = %server.addr, "connected to parameter server");
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use std::time::Duration;

    async fn start_server() -> (Arc<ParameterServer>, SocketAddr) {
        let server = Arc::new(ParameterServer::default());
        let (addr, _handle) = spawn(server.clone()).await.unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_dispatch_maps_errors() {
        let server = ParameterServer::default();
        let response = dispatch(&server, Request::GetParams(vec!["w".into()])).await;
        assert_eq!(response, Response::Failed(WireError::NotReady));

        let response = dispatch(&server, Request::IsReady).await;
        assert_eq!(response, Response::Ready(false));
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let (server, addr) = start_server().await;
        let connector = TcpConnector::default();
        let rpc = connector
            .connect(&Server::new(0, &addr.to_string()))
            .await
            .unwrap();

        let param = Parameter::new("w", ElementType::Float32, vec![1u8; 128]);
        rpc.init_param(ParameterWithConfig::new(param.clone()))
            .await
            .unwrap();
        assert!(!rpc.is_ready().await.unwrap());

        rpc.finish_init_params().await.unwrap();
        assert!(server.is_ready().await);

        let params = rpc.get_params(vec!["w".into()]).await.unwrap();
        assert_eq!(params, vec![param]);
    }

    #[tokio::test]
    async fn test_tcp_server_error_surfaces_unchanged() {
        let (_server, addr) = start_server().await;
        let rpc = TcpConnector::default()
            .connect(&Server::new(2, &addr.to_string()))
            .await
            .unwrap();
        rpc.finish_init_params().await.unwrap();

        let result = rpc.get_params(vec!["nope".into()]).await;
        assert!(matches!(result, Err(Error::UnknownParameter(name)) if name == "nope"));

        let result = rpc.finish_init_params().await;
        assert!(matches!(result, Err(Error::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnector::default()
            .connect(&Server::new(7, &addr.to_string()))
            .await;
        assert!(matches!(result, Err(Error::ShardRpc { index: 7, .. })));
    }

    #[tokio::test]
    async fn test_tcp_timeout_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, mut accepted) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Accepts and holds connections, never replies.
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
                let _ = accepted_tx.send(held.len());
            }
        });

        let config = ClientConfig {
            rpc_timeout_ms: 50,
            ..Default::default()
        };
        let rpc = TcpPserverClient::connect(&Server::new(4, &addr.to_string()), &config)
            .await
            .unwrap();
        let wait = Duration::from_secs(1);
        assert_eq!(tokio::time::timeout(wait, accepted.recv()).await.unwrap(), Some(1));

        let result = rpc.is_ready().await;
        assert!(matches!(result, Err(Error::ShardRpc { index: 4, message }) if message.contains("timed out")));

        // The timed-out connection is not reused.
        let result = rpc.is_ready().await;
        assert!(matches!(result, Err(Error::ShardRpc { index: 4, .. })));
        assert_eq!(tokio::time::timeout(wait, accepted.recv()).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_leak_response() {
        let (server, addr) = start_server().await;
        let rpc = TcpConnector::default()
            .connect(&Server::new(0, &addr.to_string()))
            .await
            .unwrap();
        let param = Parameter::new("w", ElementType::Float32, vec![1u8; 16]);
        rpc.init_param(ParameterWithConfig::new(param)).await.unwrap();
        rpc.finish_init_params().await.unwrap();

        // Start a call and drop it once the request is on the wire.
        let abandoned = rpc.get_params(vec!["w".into()]);
        assert!(tokio::time::timeout(Duration::ZERO, abandoned).await.is_err());

        assert!(rpc.is_ready().await.unwrap());
        assert_eq!(server.param_count().await, 1);
    }
}
