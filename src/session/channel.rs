//! Ordered progress delivery for one long-running operation.
//!
//! One producer, one consumer, exactly one terminal event. The producer side
//! is consumed by `complete`/`fail`; dropping it without either still emits a
//! terminal failure so consumers never hang. A consumer that goes away does
//! not stop the producer: sends to a closed channel are silently discarded.

use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Completed(Value),
    Failed(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

/// Create a connected sender/stream pair.
pub fn progress_channel() -> (ProgressSender, ProgressStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender {
            tx,
            finished: false,
        },
        ProgressStream { rx, done: false },
    )
}

pub struct ProgressSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
    finished: bool,
}

impl ProgressSender {
    /// Push an opaque chunk exactly as given.
    pub fn chunk(&self, data: impl Into<String>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        let _ = self.tx.send(StreamEvent::Chunk(data));
    }

    /// Push a human-readable progress line (newline appended).
    pub fn line(&self, line: impl AsRef<str>) {
        self.chunk(format!("{}\n", line.as_ref()));
    }

    pub fn complete(mut self, result: Value) {
        self.finished = true;
        let _ = self.tx.send(StreamEvent::Completed(result));
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.finished = true;
        let _ = self.tx.send(StreamEvent::Failed(message.into()));
    }
}

impl Drop for ProgressSender {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .tx
                .send(StreamEvent::Failed("operation ended without a result".into()));
        }
    }
}

pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl ProgressStream {
    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.done = true;
            self.rx.close();
        }
        Some(event)
    }

    /// Drain the stream to its terminal event.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_chunks_in_order_then_terminal() {
        let (tx, rx) = progress_channel();
        tx.line("Cloning acme/site...");
        tx.chunk("added 12 packages\n");
        tx.complete(json!({"ok": true}));

        let events = rx.collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("Cloning acme/site...\n".into()),
                StreamEvent::Chunk("added 12 packages\n".into()),
                StreamEvent::Completed(json!({"ok": true})),
            ]
        );
    }

    #[tokio::test]
    async fn failure_is_terminal() {
        let (tx, rx) = progress_channel();
        tx.chunk("step 1\n");
        tx.fail("boom");
        let events = rx.collect().await;
        assert_eq!(events.last(), Some(&StreamEvent::Failed("boom".into())));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn dropped_sender_emits_exactly_one_failure() {
        let (tx, rx) = progress_channel();
        tx.chunk("partial");
        drop(tx);
        let events = rx.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Failed(_)));
    }

    #[tokio::test]
    async fn sending_after_consumer_left_does_not_panic() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.line("still running");
        tx.complete(json!(null));
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let (tx, rx) = progress_channel();
        tx.chunk("");
        tx.complete(json!(1));
        assert_eq!(rx.collect().await, vec![StreamEvent::Completed(json!(1))]);
    }
}
