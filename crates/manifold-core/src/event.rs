use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

/// Pipeline stage that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Client schema <-> provider-family schema
    Transformer,
    /// Family schema <-> wire bodies and frames
    Protocol,
    /// Per-server tweaks and response repair
    ServerCompat,
    /// The actual network call
    Server,
}

/// Direction a stage was running in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client toward provider
    Request,
    /// Provider toward client
    Response,
}

/// Structured event emitted after each stage execution
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    /// Stage that ran
    pub stage: StageKind,
    /// Direction it ran in
    pub direction: Direction,
    /// Request this event belongs to
    pub request_id: String,
    /// Binding the request was pinned to
    pub binding: String,
    /// Wall time the stage took
    pub duration_ms: u64,
    /// Whether the stage succeeded
    pub ok: bool,
    /// Error summary when it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Hand-off point between the pipeline and an external capture component
///
/// Events are offered with `try_send`; a slow or absent consumer never
/// blocks the request path. Overflow is counted, not queued.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StageEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// A sink that only logs; nothing is captured
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink backed by a bounded channel for an external capture consumer
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<StageEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Offer an event to the capture consumer and trace it
    pub fn emit(&self, event: StageEvent) {
        tracing::debug!(
            stage = ?event.stage,
            direction = ?event.direction,
            request_id = %event.request_id,
            binding = %event.binding,
            duration_ms = event.duration_ms,
            ok = event.ok,
            "stage completed"
        );

        if let Some(tx) = &self.tx
            && tx.try_send(event).is_err()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped because the capture consumer fell behind
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ok: bool) -> StageEvent {
        StageEvent {
            stage: StageKind::Server,
            direction: Direction::Request,
            request_id: "req_test".to_owned(),
            binding: "openai".to_owned(),
            duration_ms: 12,
            ok,
            error: None,
        }
    }

    #[test]
    fn disabled_sink_never_drops() {
        let sink = EventSink::disabled();
        sink.emit(event(true));
        assert_eq!(sink.dropped_count(), 0);
    }

    #[tokio::test]
    async fn bounded_sink_delivers() {
        let (sink, mut rx) = EventSink::bounded(4);
        sink.emit(event(true));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.binding, "openai");
    }

    #[tokio::test]
    async fn overflow_counts_instead_of_blocking() {
        let (sink, _rx) = EventSink::bounded(1);
        sink.emit(event(true));
        sink.emit(event(false));
        assert_eq!(sink.dropped_count(), 1);
    }
}
