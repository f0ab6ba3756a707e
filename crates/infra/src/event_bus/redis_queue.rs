//! Redis-backed durable queue broker (reliable-queue pattern, at-least-once delivery).
//!
//! This implementation maps the queue topology onto plain Redis structures:
//! - **Plain queues** (primary, DLQ): a list per queue. Publish is `LPUSH`, consume is
//!   `LMOVE` from the right end into a per-consumer processing list.
//! - **TTL queues** (retry): a sorted set scored by expiry time. Expired members are
//!   promoted atomically (Lua) into the queue's dead-letter target before every receive.
//! - **In-flight**: `ack` removes the message from the processing list; `reject` moves it
//!   to the queue's dead-letter target; `release` puts it back at the front of its queue.
//! - **Failed settlement**: a delivery whose ack/reject/release failed stops counting
//!   against prefetch. It can still be settled by tag; otherwise the next receive on its
//!   queue moves it from the processing list back to the front of the queue.
//! - **Crash recovery**: declaring a plain queue restores anything left in this consumer's
//!   processing list (a previous run died before settling).
//!
//! ## Keys
//!
//! - `docflow:queue:<name>` list of ready messages
//! - `docflow:delayed:<name>` sorted set of delayed messages (member = `<uuid>|<body>`)
//! - `docflow:processing:<consumer>:<name>` in-flight messages of one consumer
//! - `docflow:topology` hash of declared queue arguments (mismatch detection)
//!
//! Redelivery after a crash is not flagged: `Delivery::redelivered` is only set for
//! messages released by this process, and only for the most recent releases.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use docflow_events::{BrokerError, Delivery, DeliveryTag, QueueBroker, QueueDeclaration};

const KEY_PREFIX: &str = "docflow";

/// Max delayed messages promoted per receive call.
const PROMOTE_BATCH: usize = 100;

/// Default pause between polls of an empty queue.
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Released bodies remembered for the `redelivered` flag.
const RELEASED_MEMORY: usize = 256;

/// Move due members of a delayed set into the target list (`KEYS[1]` -> `KEYS[2]`).
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    local sep = string.find(member, '|', 1, true)
    redis.call('LPUSH', KEYS[2], string.sub(member, sep + 1))
end
return #due
"#;

/// Move every in-flight message back to the front of its queue, oldest first.
const RECOVER_SCRIPT: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT') do
    moved = moved + 1
end
return moved
"#;

/// Put one message from a processing list (`KEYS[1]`) back at the consume end of its
/// queue (`KEYS[2]`). Nothing is pushed if the message already left the processing list.
const RESTORE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) > 0 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

#[derive(Debug, Clone)]
struct Inflight {
    queue: String,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct LocalState {
    declared: HashMap<String, QueueDeclaration>,
    inflight: HashMap<DeliveryTag, Inflight>,
    /// Settlement failed; still in the processing list, not counted against prefetch.
    orphaned: HashMap<DeliveryTag, Inflight>,
    released: VecDeque<Vec<u8>>,
    prefetch: Option<u16>,
}

impl LocalState {
    fn held(&self, queue: &str) -> usize {
        self.inflight.values().filter(|i| i.queue == queue).count()
    }

    fn take(&mut self, tag: &DeliveryTag) -> Option<Inflight> {
        self.inflight
            .remove(tag)
            .or_else(|| self.orphaned.remove(tag))
    }

    fn orphans_of(&self, queue: &str) -> Vec<(DeliveryTag, Inflight)> {
        self.orphaned
            .iter()
            .filter(|(_, i)| i.queue == queue)
            .map(|(tag, i)| (tag.clone(), i.clone()))
            .collect()
    }

    fn remember_released(&mut self, body: Vec<u8>) {
        self.released.push_back(body);
        while self.released.len() > RELEASED_MEMORY {
            self.released.pop_front();
        }
    }

    fn take_released(&mut self, body: &[u8]) -> bool {
        match self.released.iter().position(|b| b.as_slice() == body) {
            Some(pos) => {
                self.released.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct RedisQueueBroker {
    client: Arc<redis::Client>,
    connection: Arc<OnceCell<MultiplexedConnection>>,
    consumer: String,
    poll_interval: Duration,
    state: Arc<Mutex<LocalState>>,
}

impl std::fmt::Debug for RedisQueueBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueBroker")
            .field("consumer", &self.consumer)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl RedisQueueBroker {
    /// Create a broker client.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `consumer` - stable consumer name; in-flight messages are tracked per consumer
    pub fn new(redis_url: impl AsRef<str>, consumer: impl Into<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            connection: Arc::new(OnceCell::new()),
            consumer: consumer.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            state: Arc::new(Mutex::new(LocalState::default())),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(map_redis_error)
            })
            .await
            .cloned()
    }

    fn local(&self) -> Result<MutexGuard<'_, LocalState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Connection("broker state lock poisoned".to_string()))
    }

    fn declaration(&self, queue: &str) -> Result<QueueDeclaration, BrokerError> {
        self.local()?
            .declared
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{KEY_PREFIX}:processing:{}:{queue}", self.consumer)
    }

    /// Promote expired delayed messages whose dead-letter target is `queue`.
    async fn promote_due(&self, conn: &mut MultiplexedConnection, queue: &str) -> Result<(), BrokerError> {
        let sources: Vec<String> = self
            .local()?
            .declared
            .values()
            .filter(|d| d.message_ttl.is_some() && d.dead_letter_to.as_deref() == Some(queue))
            .map(|d| d.name.clone())
            .collect();

        let now_ms = chrono::Utc::now().timestamp_millis();
        for source in sources {
            let promoted: i64 = redis::Script::new(PROMOTE_SCRIPT)
                .key(delayed_key(&source))
                .key(list_key(queue))
                .arg(now_ms)
                .arg(PROMOTE_BATCH)
                .invoke_async(&mut *conn)
                .await
                .map_err(map_redis_error)?;
            if promoted > 0 {
                tracing::debug!(from = %source, to = %queue, promoted, "promoted delayed messages");
            }
        }
        Ok(())
    }

    /// Move deliveries whose settlement failed back to the front of `queue`.
    async fn requeue_orphans(&self, conn: &mut MultiplexedConnection, queue: &str) -> Result<(), BrokerError> {
        let orphans = self.local()?.orphans_of(queue);
        for (tag, orphan) in orphans {
            let restored: i64 = redis::Script::new(RESTORE_SCRIPT)
                .key(self.processing_key(queue))
                .key(list_key(queue))
                .arg(&orphan.body)
                .invoke_async(&mut *conn)
                .await
                .map_err(map_redis_error)?;

            let mut state = self.local()?;
            state.orphaned.remove(&tag);
            if restored > 0 {
                warn!(queue = %queue, delivery_tag = %tag, "requeued delivery whose settlement failed");
                state.remember_released(orphan.body);
            }
        }
        Ok(())
    }

    fn check_prefetch(&self, queue: &str) -> Result<(), BrokerError> {
        let state = self.local()?;
        if let Some(limit) = state.prefetch {
            let held = state.held(queue);
            if held >= usize::from(limit) {
                return Err(BrokerError::PrefetchExceeded {
                    queue: queue.to_string(),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn take_inflight(&self, delivery: &Delivery) -> Result<Inflight, BrokerError> {
        self.local()?
            .take(delivery.tag())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag().clone()))
    }

    /// Settlement failed: keep the tag settleable but free the prefetch slot.
    fn orphan(&self, delivery: &Delivery, inflight: Inflight, err: BrokerError) -> BrokerError {
        warn!(delivery_tag = %delivery.tag(), error = %err, "settlement failed; delivery will be requeued");
        if let Ok(mut state) = self.local() {
            state.orphaned.insert(delivery.tag().clone(), inflight);
        }
        err
    }

    async fn settle_conn(&self, delivery: &Delivery, inflight: &Inflight) -> Result<MultiplexedConnection, BrokerError> {
        match self.conn().await {
            Ok(conn) => Ok(conn),
            Err(err) => Err(self.orphan(delivery, inflight.clone(), err)),
        }
    }
}

#[async_trait]
impl QueueBroker for RedisQueueBroker {
    #[instrument(skip(self), fields(queue = %queue.name), err)]
    async fn declare(&self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;

        let expected = fingerprint(queue);
        let topology_key = format!("{KEY_PREFIX}:topology");
        let _: bool = redis::cmd("HSETNX")
            .arg(&topology_key)
            .arg(&queue.name)
            .arg(&expected)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let stored: Option<String> = redis::cmd("HGET")
            .arg(&topology_key)
            .arg(&queue.name)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if stored.as_deref() != Some(expected.as_str()) {
            return Err(BrokerError::TopologyMismatch(queue.name.clone()));
        }

        if queue.message_ttl.is_none() {
            let recovered: i64 = redis::Script::new(RECOVER_SCRIPT)
                .key(self.processing_key(&queue.name))
                .key(list_key(&queue.name))
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            if recovered > 0 {
                warn!(queue = %queue.name, recovered, "restored unsettled messages from a previous run");
            }
        }

        self.local()?
            .declared
            .insert(queue.name.clone(), queue.clone());
        info!(queue = %queue.name, "queue declared");
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.local()?.prefetch = Some(prefetch);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let declaration = self.declaration(queue)?;
        let mut conn = self.conn().await?;

        match declaration.message_ttl {
            Some(ttl) => {
                let due_ms = chrono::Utc::now().timestamp_millis()
                    + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2);
                let mut member = uuid::Uuid::now_v7().to_string().into_bytes();
                member.push(b'|');
                member.extend_from_slice(&body);

                let _: i64 = redis::cmd("ZADD")
                    .arg(delayed_key(queue))
                    .arg(due_ms)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
            }
            None => {
                let _: i64 = redis::cmd("LPUSH")
                    .arg(list_key(queue))
                    .arg(body)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
            }
        }
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.declaration(queue)?;
        self.check_prefetch(queue)?;

        let mut conn = self.conn().await?;
        self.requeue_orphans(&mut conn, queue).await?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            self.promote_due(&mut conn, queue).await?;

            let body: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(list_key(queue))
                .arg(self.processing_key(queue))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            if let Some(body) = body {
                let tag = DeliveryTag(uuid::Uuid::now_v7().to_string());
                let mut state = self.local()?;
                let redelivered = state.take_released(&body);
                state.inflight.insert(
                    tag.clone(),
                    Inflight {
                        queue: queue.to_string(),
                        body: body.clone(),
                    },
                );
                return Ok(Some(Delivery::new(tag, queue, body, redelivered)));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let inflight = self.take_inflight(delivery)?;
        let mut conn = self.settle_conn(delivery, &inflight).await?;

        let removed: Result<i64, _> = redis::cmd("LREM")
            .arg(self.processing_key(&inflight.queue))
            .arg(1)
            .arg(&inflight.body)
            .query_async(&mut conn)
            .await;
        match removed {
            Ok(_) => Ok(()),
            Err(e) => Err(self.orphan(delivery, inflight, map_redis_error(e))),
        }
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let inflight = self.take_inflight(delivery)?;
        let target = self.declaration(&inflight.queue)?.dead_letter_to;
        let mut conn = self.settle_conn(delivery, &inflight).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.processing_key(&inflight.queue))
            .arg(1)
            .arg(&inflight.body)
            .ignore();
        if let Some(target) = &target {
            pipe.cmd("LPUSH").arg(list_key(target)).arg(&inflight.body).ignore();
        }

        let result: Result<(), _> = pipe.query_async(&mut conn).await;
        result.map_err(|e| self.orphan(delivery, inflight, map_redis_error(e)))
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let inflight = self.take_inflight(delivery)?;
        let mut conn = self.settle_conn(delivery, &inflight).await?;

        let result: Result<i64, _> = redis::Script::new(RESTORE_SCRIPT)
            .key(self.processing_key(&inflight.queue))
            .key(list_key(&inflight.queue))
            .arg(&inflight.body)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(restored) => {
                if restored > 0 {
                    if let Ok(mut state) = self.local() {
                        state.remember_released(inflight.body);
                    }
                }
                Ok(())
            }
            Err(e) => Err(self.orphan(delivery, inflight, map_redis_error(e))),
        }
    }
}

fn list_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}")
}

fn delayed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:delayed:{queue}")
}

/// Canonical form of a declaration's arguments.
fn fingerprint(queue: &QueueDeclaration) -> String {
    format!(
        "durable={};ttl_ms={};dlx={}",
        queue.durable,
        queue
            .message_ttl
            .map(|t| t.as_millis().to_string())
            .unwrap_or_default(),
        queue.dead_letter_to.as_deref().unwrap_or_default()
    )
}

fn map_redis_error(err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}
