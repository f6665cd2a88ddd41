// Transport module
// The seam to the external stream supplier; wire framing lives behind it

pub mod channel;

use crate::decoder::DecoderConfig;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Stream closed: {0}")]
    Closed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Raw encoded payload from the device; framing is opaque to the decoders
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub data: Bytes,
}

impl StreamChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// External stream supplier
///
/// Implementations own the wire protocol (WebSocket stream endpoints, HTTP
/// streams, in-process feeds). `connect` wires the per-device stream and
/// returns immediately; delivery happens on the connection's channel.
pub trait StreamSource: Send + Sync {
    fn connect(&self, config: &DecoderConfig) -> Result<StreamConnection, TransportError>;
}

/// One live per-device stream
///
/// `recv` yields chunks until the remote side ends the stream (`None`).
/// `close` tells the supplier to stop producing; it is idempotent.
#[derive(Debug)]
pub struct StreamConnection {
    chunks: mpsc::Receiver<StreamChunk>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl StreamConnection {
    pub fn new(chunks: mpsc::Receiver<StreamChunk>, close_tx: oneshot::Sender<()>) -> Self {
        Self {
            chunks,
            close_tx: Some(close_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.chunks.recv().await
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        self.chunks.close();
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}
