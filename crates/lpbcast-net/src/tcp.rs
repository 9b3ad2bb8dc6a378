//! TCP transport
//!
//! One connection per exchange: connect, send a request frame, read the reply
//! frame. Node ids are resolved as `host:port`.

use crate::framing::{Frame, FrameCodec, FrameError, FrameKind};
use crate::transport::{Handler, Transport, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lpbcast_core::{Message, NodeId};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Outbound TCP transport
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, to: &NodeId, message: Message) -> Result<Message, TransportError> {
        let stream = TcpStream::connect(to.as_str()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                TransportError::InvalidAddress(to.clone())
            } else {
                TransportError::Io(e)
            }
        })?;

        let mut framed = Framed::new(stream, FrameCodec::new());
        let request = Frame::request(&message).map_err(TransportError::Encode)?;
        framed.send(request).await.map_err(|e| match e {
            FrameError::Io(e) => TransportError::Io(e),
            other => TransportError::Encode(other),
        })?;

        let frame = framed
            .next()
            .await
            .ok_or(TransportError::ConnectionClosed)??;

        match frame.kind {
            FrameKind::Response => Ok(frame.message()?),
            FrameKind::Error => Err(TransportError::Rejected(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            FrameKind::Request => Err(TransportError::Rejected(
                "peer answered with a request frame".into(),
            )),
        }
    }
}

/// Accept loop: dispatch every inbound request to `handler` until shutdown
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handler).await {
                                warn!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Listener shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn Handler>,
) -> Result<(), TransportError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match frame.kind {
            FrameKind::Request => match frame.message() {
                Ok(message) => match handler.handle(message) {
                    Ok(reply) => Frame::response(&reply)?,
                    Err(e) => Frame::error(e.to_string()),
                },
                Err(e) => Frame::error(format!("undecodable request: {}", e)),
            },
            _ => Frame::error("expected a request frame"),
        };
        framed.send(reply).await?;
    }

    Ok(())
}
