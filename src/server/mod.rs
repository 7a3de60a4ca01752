//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches newline-delimited JSON requests to a
//! handler function. Each connection is served by its own task; frames on one
//! connection are answered in order.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::ToolError;
use crate::protocol::{FrameDecoder, ProtocolError, Request, Response, encode_frame};
use crate::tools::ToolService;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The hostgate tool server.
///
/// Binds to a TCP address and dispatches incoming requests to a handler
/// function.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use hostgate::server::Server;
/// use hostgate::tools::ToolService;
///
/// # async fn run(service: Arc<ToolService>) -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::bind("127.0.0.1:7400").await?;
/// server.serve(service).await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `service`, identifying clients that send no `client_id` by
    /// their peer IP address.
    pub async fn serve(self, service: Arc<ToolService>) -> Result<(), ServerError> {
        self.run(move |mut request: Request, peer: SocketAddr| {
            let service = Arc::clone(&service);
            async move {
                if request.client_id.is_none() {
                    request.client_id = Some(peer.ip().to_string());
                }
                service.handle(request).await
            }
        })
        .await
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives each decoded [`Request`] with the peer address
    /// and resolves to the [`Response`] written back. It is shared across all
    /// connection tasks, so it must be `Send + Sync + 'static`.
    ///
    /// Runs until the process is terminated.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request, SocketAddr) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "hostgate listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// Reads until at least one full line is buffered, answers every complete
/// frame in order, then reads again. A malformed frame gets an error response
/// and the connection continues; an oversized frame closes it.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), ServerError>
where
    H: Fn(Request, SocketAddr) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut decoder = FrameDecoder::new();

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        loop {
            let response = match decoder.decode(&mut buf) {
                Ok(Some(request)) => {
                    debug!(peer = %peer_addr, method = %request.method, "dispatching request");
                    handler(request, peer_addr).await
                }
                Ok(None) => break,
                Err(ProtocolError::Malformed(e)) => {
                    warn!(peer = %peer_addr, error = %e, "malformed frame");
                    Response::failure(Value::Null, &ToolError::Validation(e.to_string()))
                }
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "closing connection");
                    let response =
                        Response::failure(Value::Null, &ToolError::Validation(e.to_string()));
                    stream.write_all(&encode_frame(&response)?).await?;
                    return Err(e.into());
                }
            };

            stream.write_all(&encode_frame(&response)?).await?;
        }
        stream.flush().await?;
    }

    Ok(())
}
