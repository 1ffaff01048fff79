//! Per-session push channels for server-initiated notifications
//!
//! Each session has at most one registered sink, normally the open SSE
//! connection. Delivery is best effort: with no sink the message is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

#[derive(Debug)]
struct Sink {
    id: u64,
    sender: UnboundedSender<Value>,
}

#[derive(Debug, Default)]
pub struct NotificationHub {
    sinks: DashMap<String, Sink>,
    next_sink_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the session's sink, replacing any previous one.
    ///
    /// The sink stays registered until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, session_id: &str) -> (SinkGuard, UnboundedReceiver<Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        if self
            .sinks
            .insert(session_id.to_string(), Sink { id, sender })
            .is_some()
        {
            debug!(session_id, "notification sink replaced");
        }

        let guard = SinkGuard {
            hub: Arc::clone(self),
            session_id: session_id.to_string(),
            sink_id: id,
        };
        (guard, receiver)
    }

    /// Sends `message` to the session's sink. Returns whether it was handed off.
    pub fn publish(&self, session_id: &str, message: Value) -> bool {
        let delivered = self
            .sinks
            .get(session_id)
            .map(|sink| sink.sender.send(message).is_ok());

        match delivered {
            Some(true) => true,
            Some(false) => {
                self.sinks
                    .remove_if(session_id, |_, sink| sink.sender.is_closed());
                trace!(session_id, "notification dropped, sink closed");
                false
            }
            None => {
                trace!(session_id, "notification dropped, no sink");
                false
            }
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.sinks
            .get(session_id)
            .is_some_and(|sink| !sink.sender.is_closed())
    }

    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }

    /// Drops the session's sink, which ends the stream reading from it.
    pub fn disconnect(&self, session_id: &str) -> bool {
        self.sinks.remove(session_id).is_some()
    }
}

/// Deregisters its sink on drop, unless a newer sink has taken its place.
#[derive(Debug)]
pub struct SinkGuard {
    hub: Arc<NotificationHub>,
    session_id: String,
    sink_id: u64,
}

impl SinkGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let sink_id = self.sink_id;
        if self
            .hub
            .sinks
            .remove_if(&self.session_id, |_, sink| sink.id == sink_id)
            .is_some()
        {
            debug!(session_id = %self.session_id, "notification sink deregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn publish_reaches_registered_sink_in_order() {
        let hub = Arc::new(NotificationHub::new());
        let (_guard, mut receiver) = hub.register("s1");

        assert!(hub.publish("s1", json!(1)));
        assert!(hub.publish("s1", json!(2)));

        assert_eq!(receiver.recv().await, Some(json!(1)));
        assert_eq!(receiver.recv().await, Some(json!(2)));
    }

    #[test]
    fn publish_without_sink_is_dropped() {
        let hub = NotificationHub::new();
        assert!(!hub.publish("nobody", json!({})));
    }

    #[test]
    fn dropping_guard_deregisters() {
        let hub = Arc::new(NotificationHub::new());
        let (guard, _receiver) = hub.register("s1");
        assert!(hub.is_connected("s1"));

        drop(guard);
        assert!(!hub.is_connected("s1"));
        assert!(!hub.publish("s1", json!({})));
    }

    #[test]
    fn stale_guard_does_not_remove_replacement() {
        let hub = Arc::new(NotificationHub::new());
        let (old_guard, _old_receiver) = hub.register("s1");
        let (_new_guard, _new_receiver) = hub.register("s1");

        drop(old_guard);
        assert!(hub.is_connected("s1"));
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn closed_receiver_is_pruned_on_publish() {
        let hub = Arc::new(NotificationHub::new());
        let (_guard, receiver) = hub.register("s1");
        drop(receiver);

        assert!(!hub.publish("s1", json!({})));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_ends_the_reader() {
        let hub = Arc::new(NotificationHub::new());
        let (_guard, mut receiver) = hub.register("s1");

        assert!(hub.disconnect("s1"));
        assert_eq!(receiver.recv().await, None);
        assert!(!hub.disconnect("s1"));
    }
}
