//! In-memory queue broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::{BrokerError, Delivery, DeliveryTag, QueueBroker};
use crate::topology::QueueDeclaration;

#[derive(Debug)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Queue {
    declaration: QueueDeclaration,
    ready: VecDeque<Message>,
    /// Messages waiting out the queue TTL. The TTL is per queue, so due times are ordered.
    delayed: VecDeque<(Instant, Vec<u8>)>,
}

#[derive(Debug)]
struct Unsettled {
    queue: String,
    body: Vec<u8>,
}

/// Settlement counters, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub acked: u64,
    pub rejected: u64,
    pub released: u64,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, Queue>,
    unsettled: HashMap<DeliveryTag, Unsettled>,
    next_tag: u64,
    prefetch: Option<u16>,
    stats: BrokerStats,
}

impl State {
    /// Move every expired TTL message to its dead-letter target.
    fn expire(&mut self, now: Instant) {
        let mut moved = Vec::new();
        for queue in self.queues.values_mut() {
            let Some(target) = queue.declaration.dead_letter_to.clone() else {
                continue;
            };
            while queue.delayed.front().is_some_and(|(due, _)| *due <= now) {
                if let Some((_, body)) = queue.delayed.pop_front() {
                    moved.push((target.clone(), body));
                }
            }
        }
        for (target, body) in moved {
            self.route(&target, body);
        }
    }

    fn route(&mut self, target: &str, body: Vec<u8>) {
        match self.queues.get_mut(target) {
            Some(queue) => queue.ready.push_back(Message {
                body,
                redelivered: false,
            }),
            None => tracing::warn!(queue = target, "dead-letter target not declared; message dropped"),
        }
    }

    /// Earliest moment a delayed message becomes ready on `queue`.
    fn next_due_for(&self, queue: &str) -> Option<Instant> {
        self.queues
            .values()
            .filter(|q| q.declaration.dead_letter_to.as_deref() == Some(queue))
            .filter_map(|q| q.delayed.front().map(|(due, _)| *due))
            .min()
    }

    fn take_next(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }

        if let Some(limit) = self.prefetch {
            let held = self.unsettled.values().filter(|u| u.queue == queue).count();
            if held >= usize::from(limit) {
                return Err(BrokerError::PrefetchExceeded {
                    queue: queue.to_string(),
                    limit,
                });
            }
        }

        let Some(message) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };

        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag.to_string());
        self.unsettled.insert(
            tag.clone(),
            Unsettled {
                queue: queue.to_string(),
                body: message.body.clone(),
            },
        );

        Ok(Some(Delivery::new(tag, queue, message.body, message.redelivered)))
    }

    fn settle(&mut self, delivery: &Delivery) -> Result<Unsettled, BrokerError> {
        self.unsettled
            .remove(delivery.tag())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag().clone()))
    }
}

/// In-memory broker with the same topology semantics as a real one.
///
/// - TTL queues hold messages until expiry, then route them to their dead-letter target
/// - Rejected deliveries go to the queue's dead-letter target
/// - Uses the tokio clock, so tests can pause and advance time
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    published: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Connection("in-memory broker lock poisoned".to_string()))
    }

    /// Bodies currently held by `queue` (ready first, then delayed).
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| m.body.clone())
                    .chain(q.delayed.iter().map(|(_, body)| body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.messages(queue).len()
    }

    pub fn unsettled_count(&self) -> usize {
        self.state.lock().unwrap().unsettled.len()
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().unwrap().stats
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn declare(&self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.declaration != *queue => {
                Err(BrokerError::TopologyMismatch(queue.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    Queue {
                        declaration: queue.clone(),
                        ready: VecDeque::new(),
                        delayed: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.lock()?.prefetch = Some(prefetch);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

            match q.declaration.message_ttl {
                Some(ttl) => q.delayed.push_back((Instant::now() + ttl, body)),
                None => q.ready.push_back(Message {
                    body,
                    redelivered: false,
                }),
            }
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.published.notified();

            let next_due = {
                let mut state = self.lock()?;
                state.expire(Instant::now());
                if let Some(delivery) = state.take_next(queue)? {
                    return Ok(Some(delivery));
                }
                state.next_due_for(queue)
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = notified => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.settle(delivery)?;
        state.stats.acked += 1;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let unsettled = state.settle(delivery)?;
        let target = state
            .queues
            .get(&unsettled.queue)
            .and_then(|q| q.declaration.dead_letter_to.clone());
        if let Some(target) = target {
            state.route(&target, unsettled.body);
        }
        state.stats.rejected += 1;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;
            let unsettled = state.settle(delivery)?;
            if let Some(queue) = state.queues.get_mut(&unsettled.queue) {
                queue.ready.push_front(Message {
                    body: unsettled.body,
                    redelivered: true,
                });
            }
            state.stats.released += 1;
        }
        self.published.notify_waiters();
        Ok(())
    }
}
