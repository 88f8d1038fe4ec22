//! Finite event sources produced by streaming invocations.

use bytes::Bytes;
use crucible_primitives::{OutputStream, StreamErrorCause, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the producer/consumer channel backing an [`EventSource`].
const CHANNEL_CAPACITY: usize = 64;

/// Consumer handle for a streaming invocation.
///
/// Yields output chunks in producer order and terminates with exactly one
/// `Exit` or `Error` event. Dropping the source before the terminal event
/// cancels the producer side, which tears down sandbox resources before
/// exiting.
#[derive(Debug)]
pub struct EventSource {
    rx: mpsc::Receiver<StreamEvent>,
    guard: CancellationToken,
}

impl EventSource {
    /// Creates a channel pair: the [`EventSource`] for the consumer and an
    /// [`EventSender`] for the producer task. The producer must observe
    /// `guard` and release sandbox resources when it fires.
    pub(crate) fn channel(guard: CancellationToken) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                rx,
                guard: guard.clone(),
            },
            EventSender { tx, guard },
        )
    }

    /// Receives the next event, or `None` once the sequence is complete.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drains the source to completion, returning all events in order.
    pub async fn drain(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        // Consumer abandonment: stop the producer so sandbox resources are
        // released even when nobody is draining.
        self.guard.cancel();
    }
}

/// Producer handle used by backends to emit events.
///
/// Send failures mean the consumer went away; producers treat that as a
/// teardown signal, not an error.
#[derive(Clone, Debug)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
    guard: CancellationToken,
}

impl EventSender {
    /// Token the producer must observe for consumer abandonment and caller
    /// cancellation.
    pub(crate) fn guard(&self) -> &CancellationToken {
        &self.guard
    }

    /// Emits an output chunk. Returns `false` when the consumer is gone.
    pub(crate) async fn output(&self, stream: OutputStream, bytes: Bytes) -> bool {
        self.tx
            .send(StreamEvent::Output { stream, bytes })
            .await
            .is_ok()
    }

    /// Blocking variant of [`EventSender::output`] for producers running on
    /// blocking threads.
    pub(crate) fn output_blocking(&self, stream: OutputStream, bytes: Bytes) -> bool {
        self.tx
            .blocking_send(StreamEvent::Output { stream, bytes })
            .is_ok()
    }

    /// Emits the terminal exit event.
    pub(crate) async fn exit(self, code: i32) {
        let _ = self.tx.send(StreamEvent::Exit { code }).await;
    }

    /// Emits the terminal error event.
    pub(crate) async fn error(self, cause: StreamErrorCause, message: impl Into<String>) {
        let _ = self
            .tx
            .send(StreamEvent::Error {
                cause,
                message: message.into(),
            })
            .await;
    }
}
