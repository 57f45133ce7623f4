//! The Subscription Bus: single in-process publisher
//! with per-conversation and global fan-out.
//!
//! Keeps one `tokio::sync::broadcast::Sender` per conversation behind an
//! `RwLock<HashMap<...>>`, plus a global all-conversations channel, and
//! forwards each into a bounded `mpsc` downstream of the broadcast receiver
//! so a slow subscriber can't stall the publisher.
//!
//! Backlog replay (a subscriber passing `since_seq`) is not this crate's
//! job: the bus only ever forwards live events. Callers that need a
//! gapless stream compose `cv_store::EventStore::get_events_since` for the
//! backlog with a freshly opened live [`Bus::subscribe`], deduplicating by
//! `seq` — the same "explicit tasks + typed channels" shape as the turn
//! executor.

use std::collections::HashMap;
use std::sync::Arc;

use cv_domain::{Event, Guidance};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What a subscriber receives: a committed event, a transient guidance hint
/// (never persisted), or a lag sentinel when this subscriber's queue
/// overflowed and events were dropped.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Event(Event),
    Guidance(Guidance),
    Lagged { last_seen_seq: i64 },
}

impl BusEvent {
    fn conversation_id(&self) -> Option<i64> {
        match self {
            BusEvent::Event(e) => Some(e.conversation_id),
            BusEvent::Guidance(g) => Some(g.conversation_id),
            BusEvent::Lagged { .. } => None,
        }
    }

    fn seq(&self) -> Option<i64> {
        match self {
            BusEvent::Event(e) => Some(e.seq),
            _ => None,
        }
    }
}

/// Optional narrowing applied before an event reaches a subscriber's queue.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub types: Option<Vec<cv_domain::EventType>>,
    pub agents: Option<Vec<String>>,
}

impl SubscriptionFilter {
    fn matches(&self, ev: &BusEvent) -> bool {
        match ev {
            BusEvent::Event(e) => {
                let type_ok = self
                    .types
                    .as_ref()
                    .map(|ts| ts.contains(&e.event_type))
                    .unwrap_or(true);
                let agent_ok = self
                    .agents
                    .as_ref()
                    .map(|agents| agents.iter().any(|a| a == &e.agent_id))
                    .unwrap_or(true);
                type_ok && agent_ok
            }
            BusEvent::Guidance(_) | BusEvent::Lagged { .. } => true,
        }
    }
}

pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<BusEvent>,
}

const BROADCAST_CAPACITY: usize = 4096;

struct Conversations {
    channels: HashMap<i64, broadcast::Sender<BusEvent>>,
}

/// The bus. Cheap to clone (wraps an `Arc`); typically constructed once and
/// shared via `AppState`.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

struct Inner {
    conversations: RwLock<Conversations>,
    global: broadcast::Sender<BusEvent>,
    subscriber_queue_depth: usize,
    subscribers: RwLock<HashMap<Uuid, JoinHandle<()>>>,
}

impl Bus {
    pub fn new(subscriber_queue_depth: usize) -> Self {
        let (global, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                conversations: RwLock::new(Conversations {
                    channels: HashMap::new(),
                }),
                global,
                subscriber_queue_depth,
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn conversation_sender(&self, conversation_id: i64) -> broadcast::Sender<BusEvent> {
        if let Some(tx) = self
            .inner
            .conversations
            .read()
            .channels
            .get(&conversation_id)
        {
            return tx.clone();
        }
        let mut conversations = self.inner.conversations.write();
        conversations
            .channels
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone()
    }

    /// Publishes to both the conversation-scoped channel and the global
    /// all-conversations channel, in that order, so listeners observe
    /// commit order for a given conversation (delivery contract).
    pub fn publish(&self, conversation_id: i64, event: BusEvent) {
        let tx = self.conversation_sender(conversation_id);
        let _ = tx.send(event.clone());
        let _ = self.inner.global.send(event);
    }

    pub fn subscribe(
        &self,
        conversation_id: i64,
        filter: Option<SubscriptionFilter>,
        include_guidance: bool,
    ) -> Subscription {
        let broadcast_rx = self.conversation_sender(conversation_id).subscribe();
        self.spawn_forwarder(broadcast_rx, filter, include_guidance)
    }

    pub fn subscribe_all(
        &self,
        filter: Option<SubscriptionFilter>,
        include_guidance: bool,
    ) -> Subscription {
        let broadcast_rx = self.inner.global.subscribe();
        self.spawn_forwarder(broadcast_rx, filter, include_guidance)
    }

    pub fn unsubscribe(&self, sub_id: Uuid) {
        if let Some(handle) = self.inner.subscribers.write().remove(&sub_id) {
            handle.abort();
        }
    }

    fn spawn_forwarder(
        &self,
        mut broadcast_rx: broadcast::Receiver<BusEvent>,
        filter: Option<SubscriptionFilter>,
        include_guidance: bool,
    ) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.subscriber_queue_depth);

        let task = tokio::spawn(async move {
            let mut lagged = false;
            let mut last_seen_seq: i64 = 0;

            loop {
                match broadcast_rx.recv().await {
                    Ok(ev) => {
                        if matches!(ev, BusEvent::Guidance(_)) && !include_guidance {
                            continue;
                        }
                        if let Some(filter) = &filter {
                            if !filter.matches(&ev) {
                                continue;
                            }
                        }

                        if lagged {
                            if tx
                                .try_send(BusEvent::Lagged { last_seen_seq })
                                .is_err()
                            {
                                continue;
                            }
                            lagged = false;
                        }

                        if let Some(seq) = ev.seq() {
                            last_seen_seq = seq;
                        }
                        if tx.try_send(ev).is_err() {
                            lagged = true;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        lagged = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.inner.subscribers.write().insert(id, task);
        Subscription { id, receiver: rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_domain::{EventPayload, EventType, Finality};
    use chrono::Utc;

    fn sample_event(conversation_id: i64, seq: i64) -> Event {
        Event {
            conversation_id,
            seq,
            turn: 1,
            event: seq,
            event_type: EventType::Message,
            payload: EventPayload::Message {
                text: Some("hi".into()),
                attachments: None,
                raw: Default::default(),
            },
            finality: Finality::None,
            agent_id: "alice".into(),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe(1, None, false);
        bus.publish(1, BusEvent::Event(sample_event(1, 1)));

        let received = sub.receiver.recv().await.expect("event delivered");
        match received {
            BusEvent::Event(e) => assert_eq!(e.seq, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscriber_does_not_see_other_conversations() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe(1, None, false);
        bus.publish(2, BusEvent::Event(sample_event(2, 1)));
        bus.publish(1, BusEvent::Event(sample_event(1, 1)));

        let received = sub.receiver.recv().await.expect("event delivered");
        match received {
            BusEvent::Event(e) => assert_eq!(e.conversation_id, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn guidance_is_excluded_unless_requested() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe(1, None, false);
        bus.publish(
            1,
            BusEvent::Guidance(Guidance {
                conversation_id: 1,
                next_agent_id: "bob".into(),
                kind: cv_domain::GuidanceKind::StartTurn,
                turn: 1,
                seq: 1.0,
                deadline_ms: 30_000,
            }),
        );
        bus.publish(1, BusEvent::Event(sample_event(1, 1)));

        let received = sub.receiver.recv().await.expect("event delivered");
        assert!(matches!(received, BusEvent::Event(_)));
    }

    #[tokio::test]
    async fn subscribe_all_sees_every_conversation() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe_all(None, false);
        bus.publish(1, BusEvent::Event(sample_event(1, 1)));
        bus.publish(2, BusEvent::Event(sample_event(2, 1)));

        let first = sub.receiver.recv().await.unwrap();
        let second = sub.receiver.recv().await.unwrap();
        let ids: Vec<i64> = [first, second]
            .iter()
            .filter_map(|e| e.conversation_id())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Bus::new(16);
        let sub = bus.subscribe(1, None, false);
        let id = sub.id;
        drop(sub);
        // Aborting an already-dropped-receiver task is a no-op but must not panic.
        bus.unsubscribe(id);
        bus.publish(1, BusEvent::Event(sample_event(1, 1)));
    }
}
