// Decoder lifecycle events
// One ordered channel per session; the Host UI's single place to observe
// decode health

use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle surface of a decoder session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DecoderEvent {
    /// Stream established and the first frame reached the surface
    Connected,
    /// Stream ended from the remote side, cleanly or not
    Disconnected,
    /// Initialization, transient or terminal failure; an error does not by
    /// itself end the session
    Error { message: String },
}

impl DecoderEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Receiving half handed to the Host UI
pub type EventReceiver = mpsc::UnboundedReceiver<DecoderEvent>;

/// Emitting half owned by the session driver
///
/// Events are delivered in emission order; dropping the sender closes the
/// channel, which is how teardown guarantees nothing is observed afterwards.
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<DecoderEvent>,
}

impl EventSender {
    pub fn emit(&self, event: DecoderEvent) {
        log::debug!("Decoder event: {:?}", event);
        // The host may have dropped its receiver; that is not an error
        let _ = self.tx.send(event);
    }
}

/// Create the per-session event channel
pub(crate) fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (tx, mut rx) = channel();
        tx.emit(DecoderEvent::Connected);
        tx.emit(DecoderEvent::error("stall"));
        tx.emit(DecoderEvent::Disconnected);

        assert_eq!(rx.recv().await, Some(DecoderEvent::Connected));
        assert_eq!(
            rx.recv().await,
            Some(DecoderEvent::error("stall"))
        );
        assert_eq!(rx.recv().await, Some(DecoderEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_channel_closes_when_sender_drops() {
        let (tx, mut rx) = channel();
        tx.emit(DecoderEvent::Connected);
        drop(tx);

        assert_eq!(rx.recv().await, Some(DecoderEvent::Connected));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&DecoderEvent::Connected).unwrap();
        assert_eq!(json, r#"{"event":"connected"}"#);

        let json = serde_json::to_string(&DecoderEvent::error("codec fault")).unwrap();
        assert_eq!(json, r#"{"event":"error","message":"codec fault"}"#);
    }
}
