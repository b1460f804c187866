use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::stats::StatsDocument;

#[derive(Clone, Debug, PartialEq)]
pub enum StatsUpdate {
    Stats(StatsDocument),
    /// The playback session for this id has closed.
    Finished,
}

impl StatsUpdate {
    /// One server-sent event frame.
    pub fn to_sse(&self) -> String {
        match self {
            StatsUpdate::Stats(doc) => {
                let data = serde_json::json!({
                    "file_id": doc.file_id,
                    "stats": doc.stats,
                    "error_times": doc.error_times,
                    "frames_processed": doc.frames_processed,
                });
                format!("event: update_stats\ndata: {}\n\n", data)
            }
            StatsUpdate::Finished => "event: finished\ndata: {}\n\n".to_string(),
        }
    }
}

#[derive(Default)]
struct Listeners {
    senders: HashMap<String, Vec<(u64, Sender<StatsUpdate>)>>,
    live: HashMap<String, usize>,
    next_id: u64,
}

/// Fans stats flushes out to the listeners of each file id, and tracks which
/// ids have a playback session running.
#[derive(Clone, Default)]
pub struct StatsBroadcaster {
    inner: Arc<Mutex<Listeners>>,
}

/// One feed's receiving end. Dropping it unregisters the listener.
pub struct Subscription {
    rx: Receiver<StatsUpdate>,
    id: u64,
    file_id: String,
    session_live: bool,
    hub: StatsBroadcaster,
}

impl Subscription {
    /// Whether a session for this id was running when the feed subscribed.
    pub fn session_live(&self) -> bool {
        self.session_live
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<StatsUpdate, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<StatsUpdate, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.file_id, self.id);
    }
}

impl StatsBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, file_id: &str) -> Subscription {
        let (tx, rx) = channel();
        let mut id = 0;
        let mut session_live = false;
        if let Ok(mut inner) = self.inner.lock() {
            id = inner.next_id;
            inner.next_id += 1;
            session_live = inner.live.contains_key(file_id);
            inner
                .senders
                .entry(file_id.to_string())
                .or_default()
                .push((id, tx));
        }
        Subscription {
            rx,
            id,
            file_id: file_id.to_string(),
            session_live,
            hub: self.clone(),
        }
    }

    /// Mark a playback session for `file_id` as running until `finish`.
    pub fn begin(&self, file_id: &str) {
        match self.inner.lock() {
            Ok(mut inner) => *inner.live.entry(file_id.to_string()).or_insert(0) += 1,
            Err(_) => log::warn!("stats broadcaster lock poisoned"),
        }
    }

    pub fn publish(&self, doc: &StatsDocument) {
        self.send(&doc.file_id, StatsUpdate::Stats(doc.clone()));
    }

    /// End one session for `file_id` and tell its listeners.
    pub fn finish(&self, file_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(count) = inner.live.get_mut(file_id) {
                *count -= 1;
                if *count == 0 {
                    inner.live.remove(file_id);
                }
            }
        }
        self.send(file_id, StatsUpdate::Finished);
    }

    pub fn is_live(&self, file_id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.live.contains_key(file_id))
            .unwrap_or(false)
    }

    pub fn listener_count(&self, file_id: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.senders.get(file_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn unsubscribe(&self, file_id: &str, id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(senders) = inner.senders.get_mut(file_id) {
            senders.retain(|(sub, _)| *sub != id);
            if senders.is_empty() {
                inner.senders.remove(file_id);
            }
        }
    }

    fn send(&self, file_id: &str, update: StatsUpdate) {
        let Ok(mut inner) = self.inner.lock() else {
            log::warn!("stats broadcaster lock poisoned");
            return;
        };
        if let Some(senders) = inner.senders.get_mut(file_id) {
            senders.retain(|(_, tx)| tx.send(update.clone()).is_ok());
            if senders.is_empty() {
                inner.senders.remove(file_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(file_id: &str, frames: u64) -> StatsDocument {
        StatsDocument {
            file_id: file_id.to_string(),
            frames_processed: frames,
            ..StatsDocument::default()
        }
    }

    #[test]
    fn delivers_only_to_matching_listeners() {
        let hub = StatsBroadcaster::new();
        let a = hub.subscribe("a");
        let b = hub.subscribe("b");
        hub.publish(&doc("a", 50));
        hub.finish("a");

        assert_eq!(a.try_recv().unwrap(), StatsUpdate::Stats(doc("a", 50)));
        assert_eq!(a.try_recv().unwrap(), StatsUpdate::Finished);
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn dropped_subscriptions_unregister_immediately() {
        let hub = StatsBroadcaster::new();
        let first = hub.subscribe("a");
        let second = hub.subscribe("a");
        assert_eq!(hub.listener_count("a"), 2);
        drop(first);
        assert_eq!(hub.listener_count("a"), 1);
        drop(second);
        assert_eq!(hub.listener_count("a"), 0);
    }

    #[test]
    fn tracks_live_sessions() {
        let hub = StatsBroadcaster::new();
        assert!(!hub.subscribe("a").session_live());

        hub.begin("a");
        hub.begin("a");
        let during = hub.subscribe("a");
        assert!(during.session_live());
        assert!(!hub.subscribe("b").session_live());

        hub.finish("a");
        assert!(hub.is_live("a"));
        hub.finish("a");
        assert!(!hub.is_live("a"));
        assert_eq!(during.try_recv().unwrap(), StatsUpdate::Finished);
        assert_eq!(during.try_recv().unwrap(), StatsUpdate::Finished);

        // finishing an id with no session is harmless
        hub.finish("b");
        assert!(!hub.is_live("b"));
    }

    #[test]
    fn formats_server_sent_events() {
        let sse = StatsUpdate::Stats(doc("a", 3)).to_sse();
        assert!(sse.starts_with("event: update_stats\ndata: {"));
        assert!(sse.contains("\"frames_processed\":3"));
        assert!(sse.ends_with("\n\n"));
        assert_eq!(StatsUpdate::Finished.to_sse(), "event: finished\ndata: {}\n\n");
    }
}
