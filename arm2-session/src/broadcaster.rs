//! The event fanout actor: a single task owns the subscription table; every mutation and every
//! broadcast goes through its inbox channels.

use std::collections::HashMap;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

const SUBSCRIPTION_CAPACITY: usize = 64;
const BROADCAST_CAPACITY: usize = 256;

/// The three event categories a WebSocket client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    State,
    Output,
    Event,
}

/// One message handed to every matching subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub data: serde_json::Value,
}

/// A live subscription: empty `session_filter` or `type_filter` mean "match everything".
struct Subscription {
    session_filter: String,
    type_filter: Vec<EventKind>,
    sender: mpsc::Sender<Event>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        (self.session_filter.is_empty() || self.session_filter == event.session_id)
            && (self.type_filter.is_empty() || self.type_filter.contains(&event.kind))
    }
}

enum Command {
    Register { session_filter: String, type_filter: Vec<EventKind>, reply: oneshot::Sender<(u64, mpsc::Receiver<Event>)> },
    Unregister { id: u64 },
    Broadcast(Event),
    Shutdown,
}

/// Handle used by producers (the executor thread via the output sink, HTTP handlers) and
/// subscribers (WebSocket pumps) to talk to the fanout task.
#[derive(Clone)]
pub struct BroadcasterHandle {
    commands: mpsc::Sender<Command>,
}

pub struct Subscriber {
    pub id: u64,
    pub receiver: mpsc::Receiver<Event>,
}

impl BroadcasterHandle {
    /// `session_filter`: empty string matches every session. `type_filter`: empty vec matches
    /// every event kind.
    pub async fn subscribe(&self, session_filter: String, type_filter: Vec<EventKind>) -> Subscriber {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Register { session_filter, type_filter, reply: reply_tx })
            .await
            .is_err()
        {
            // The loop is gone; hand back an already-closed channel rather than panicking.
            let (_tx, rx) = mpsc::channel(1);
            return Subscriber { id: 0, receiver: rx };
        }
        match reply_rx.await {
            Ok((id, receiver)) => Subscriber { id, receiver },
            Err(_) => {
                let (_tx, rx) = mpsc::channel(1);
                Subscriber { id: 0, receiver: rx }
            }
        }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.commands.send(Command::Unregister { id }).await;
    }

    /// Non-blocking from the caller's point of view: the inbox send itself may await briefly,
    /// but a full broadcast inbox causes the event to be dropped rather than the caller stalled
    /// (the inbox capacity already absorbs ordinary bursts).
    pub fn broadcast(&self, event: Event) {
        if self.commands.try_send(Command::Broadcast(event)).is_err() {
            warn!("broadcaster inbox full, dropping event");
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Spawns the fanout task and returns a handle to it. The task runs until `shutdown()` is
/// called, at which point every subscription channel is dropped (closing it for its reader).
pub fn spawn() -> BroadcasterHandle {
    let (tx, mut rx) = mpsc::channel(BROADCAST_CAPACITY);
    let handle = BroadcasterHandle { commands: tx };

    tokio::spawn(async move {
        let mut subscriptions: HashMap<u64, Subscription> = HashMap::new();
        let mut next_id: u64 = 1;

        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Register { session_filter, type_filter, reply } => {
                    let id = next_id;
                    next_id += 1;
                    let (sub_tx, sub_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
                    subscriptions.insert(id, Subscription { session_filter, type_filter, sender: sub_tx });
                    let _ = reply.send((id, sub_rx));
                }
                Command::Unregister { id } => {
                    subscriptions.remove(&id);
                }
                Command::Broadcast(event) => {
                    for sub in subscriptions.values() {
                        if sub.matches(&event) {
                            if sub.sender.try_send(event.clone()).is_err() {
                                debug!("slow subscriber dropped an event");
                            }
                        }
                    }
                }
                Command::Shutdown => {
                    subscriptions.clear();
                    break;
                }
            }
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wildcard_subscriber_receives_everything() {
        let handle = spawn();
        let mut sub = handle.subscribe(String::new(), Vec::new()).await;
        handle.broadcast(Event {
            kind: EventKind::Output,
            session_id: "abc".to_string(),
            data: serde_json::json!({"stream": "stdout", "content": "hi"}),
        });
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.session_id, "abc");
    }

    #[tokio::test]
    async fn session_filter_excludes_other_sessions() {
        let handle = spawn();
        let mut sub = handle.subscribe("target".to_string(), Vec::new()).await;
        handle.broadcast(Event { kind: EventKind::State, session_id: "other".to_string(), data: serde_json::json!({}) });
        handle.broadcast(Event { kind: EventKind::State, session_id: "target".to_string(), data: serde_json::json!({}) });
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.session_id, "target");
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let handle = spawn();
        let mut sub = handle.subscribe(String::new(), Vec::new()).await;
        handle.unsubscribe(sub.id).await;
        assert!(sub.receiver.recv().await.is_none());
    }
}
