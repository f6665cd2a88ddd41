// In-process stream source
// Backs tests and embedders that already own a wire protocol: chunks are
// published per device and delivered over the session's stream connection

use super::{StreamChunk, StreamConnection, StreamSource, TransportError};
use crate::decoder::DecoderConfig;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const CHUNK_QUEUE_DEPTH: usize = 64;

struct Feed {
    generation: u64,
    tx: mpsc::Sender<StreamChunk>,
}

/// Channel-backed stream source
///
/// `connect` registers a feed for the device; `publisher` hands out the
/// sending half; `end_stream` simulates the remote side closing.
#[derive(Clone, Default)]
pub struct ChannelStreamSource {
    feeds: Arc<Mutex<HashMap<u64, Feed>>>,
    refuse: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl ChannelStreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail, as an unreachable device would
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// The sending half of a device's live feed
    pub fn publisher(&self, device_id: u64) -> Option<StreamPublisher> {
        let feeds = self.feeds.lock();
        feeds.get(&device_id).map(|feed| StreamPublisher {
            tx: feed.tx.clone(),
        })
    }

    /// Simulate the remote side ending the stream
    pub fn end_stream(&self, device_id: u64) {
        if self.feeds.lock().remove(&device_id).is_some() {
            log::debug!("Stream for device {} ended", device_id);
        }
    }

    pub fn is_streaming(&self, device_id: u64) -> bool {
        self.feeds.lock().contains_key(&device_id)
    }
}

impl StreamSource for ChannelStreamSource {
    fn connect(&self, config: &DecoderConfig) -> Result<StreamConnection, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "Device {} unreachable",
                config.device_id
            )));
        }

        let device_id = config.device_id;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let (close_tx, close_rx) = oneshot::channel();

        self.feeds.lock().insert(device_id, Feed { generation, tx });

        // Tear the feed down when the session closes its end, unless a newer
        // connection already replaced it
        let feeds = self.feeds.clone();
        tokio::spawn(async move {
            let _ = close_rx.await;
            let mut feeds = feeds.lock();
            if feeds.get(&device_id).is_some_and(|f| f.generation == generation) {
                feeds.remove(&device_id);
            }
        });

        log::debug!("Stream connected for device {}", device_id);
        Ok(StreamConnection::new(rx, close_tx))
    }
}

/// Sending half of a device feed
#[derive(Clone)]
pub struct StreamPublisher {
    tx: mpsc::Sender<StreamChunk>,
}

impl StreamPublisher {
    /// Publish one chunk; returns false once the consumer is gone
    pub async fn send(&self, data: impl Into<Bytes>) -> bool {
        self.tx.send(StreamChunk::new(data.into())).await.is_ok()
    }
}
