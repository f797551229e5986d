use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use super::models::Session;

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Fans full-state snapshots out to every observer of a session id.
///
/// State mutation and delivery are separate: the state machine produces an
/// immutable snapshot and hands it here; observers that lag simply miss
/// intermediate snapshots and catch up on the next one.
#[derive(Default)]
pub struct SessionNotifier {
    channels: Mutex<HashMap<String, broadcast::Sender<Session>>>,
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Session> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver `snapshot` to current subscribers. Returns how many received it.
    pub fn publish(&self, snapshot: &Session) -> usize {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = channels.get(&snapshot.id) else {
            return 0;
        };
        match tx.send(snapshot.clone()) {
            Ok(count) => count,
            Err(_) => {
                // Nobody is listening any more.
                channels.remove(&snapshot.id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
