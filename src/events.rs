//! Typed event bus: the notification kinds published
//! as loosely-typed `(key, payload)` pairs, given a concrete payload type
//! each so subscribers don't have to downcast.

use crate::hostmap::HostMap;
use crate::server_key::ServerKey;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Primary interface's connection status changed.
    Status(ConnectionStatus),
    /// `(local_height, server_height)` changed.
    Updated(u64, u64),
    /// The primary server's banner text was (re)fetched.
    Banner(String),
    /// Fee-per-kb estimates keyed by confirmation target.
    Fee(HashMap<u32, u64>),
    /// The known-servers registry changed.
    Servers(HostMap),
    /// The set of currently connected interfaces changed.
    Interfaces(Vec<ServerKey>),
}

/// Broadcasts [`Event`]s to any number of listeners. Built on
/// `tokio::sync::broadcast` the way the supervisor fans state out to callers
/// without handing them a lock on its internal tables.
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(256);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event; a lagging or absent subscriber is not an error,
    /// fire-and-forget: no subscribers means the event is simply dropped.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::Updated(10, 20));
        match rx.recv().await.unwrap() {
            Event::Updated(local, server) => {
                assert_eq!(local, 10);
                assert_eq!(server, 20);
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::Banner("hello".to_string()));
    }
}
