//! WebSocket server for handling command connections.
//!
//! Accepts incoming TCP connections, completes the WebSocket handshake,
//! and answers each message on its own task.

use crate::config::Config;
use crate::protocol::{self, ProtocolError};
use crate::registry::ConnectionRegistry;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

/// Errors that end a single connection's handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    label: Arc<str>,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let addr = tokio::net::lookup_host(config.listen_addr())
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("could not resolve {}", config.listen_addr()),
                )
            })?;

        let listener = create_listener(addr, config.backlog)?;

        Ok(Server {
            listener,
            registry: ConnectionRegistry::new(),
            label: Arc::from(config.label.as_str()),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registry of currently open connections.
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Accept connections until the process is terminated.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    let registry = Arc::clone(&self.registry);
                    let label = Arc::clone(&self.label);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, registry, label).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    label: Arc<str>,
) -> Result<(), HandlerError> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(HandlerError::Handshake)?;

    let registration = registry.register(peer);
    info!(
        peer = %peer,
        conn_id = registration.id(),
        active = registry.len(),
        "Client connected"
    );

    let result = serve(&mut ws, &label).await;

    if let Err(HandlerError::Protocol(ref e)) = result {
        warn!(peer = %peer, error = %e, "Dropping connection after malformed request");
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: "malformed request".into(),
        };
        if let Err(e) = ws.close(Some(frame)).await {
            trace!(error = %e, "Close frame not delivered");
        }
    }

    let open_for = registration.close().unwrap_or_default();
    info!(
        peer = %peer,
        open_ms = open_for.as_millis() as u64,
        active = registry.len(),
        "Client disconnected"
    );
    if registry.is_empty() {
        debug!("No clients connected");
    }

    result
}

/// Read, decode, dispatch and answer messages until the peer goes away.
async fn serve<S>(ws: &mut WebSocketStream<S>, label: &str) -> Result<(), HandlerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws.next().await {
        let command = match message? {
            Message::Text(text) => protocol::parse(text.as_str().as_bytes())?,
            Message::Binary(data) => protocol::parse(&data)?,
            Message::Close(frame) => {
                // The close reply is flushed on the next read, which then ends the stream
                trace!(?frame, "Close frame received");
                continue;
            }
            // Pings are answered by tungstenite itself
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        info!(command = command.name(), "Received command");

        let response = protocol::dispatch(&command, label);
        ws.send(Message::text(response.to_json()?)).await?;
    }

    Ok(())
}
