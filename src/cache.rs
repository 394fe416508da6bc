//! DNS response cache with FIFO eviction, TTL expiry and optional background
//! prefetch. Write operations are mirrored to a persistence [`Backend`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::resolver::Client;

/// 后台任务队列长度 / capacity of the background task queue
const TASK_QUEUE_CAPACITY: usize = 1024;

/// RFC 2181 maximum TTL, used when a message carries no TTL-bearing records.
const MAX_TTL_SECS: u32 = (1 << 31) - 1;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 16_777_619;

/// Cache key for a question: 32-bit FNV-1a over the lowercased name with any
/// single trailing dot stripped, then qtype and qclass in big-endian order.
/// The hash is part of the on-disk format and must stay stable across
/// releases and byte orders.
pub fn fingerprint(name: &str, qtype: u16, qclass: u16) -> u32 {
    let name = name.strip_suffix('.').unwrap_or(name);
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.bytes() {
        hash = (hash ^ u32::from(byte.to_ascii_lowercase())).wrapping_mul(FNV_PRIME);
    }
    for byte in qtype.to_be_bytes() {
        hash = (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME);
    }
    for byte in qclass.to_be_bytes() {
        hash = (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Lowest TTL across the answer, authority and additional sections.
pub fn min_ttl(msg: &Message) -> Duration {
    let mut ttl = MAX_TTL_SECS;
    for record in msg.answers().iter().chain(msg.name_servers()) {
        ttl = ttl.min(record.ttl());
    }
    for record in msg.additionals() {
        // OPT is a pseudo record whose TTL field carries extended rcode and flags
        if record.record_type() == RecordType::OPT {
            continue;
        }
        ttl = ttl.min(record.ttl());
    }
    Duration::from_secs(u64::from(ttl))
}

fn cacheable(msg: &Message) -> bool {
    if min_ttl(msg).is_zero() {
        return false;
    }
    matches!(
        msg.response_code(),
        ResponseCode::NoError | ResponseCode::NXDomain
    )
}

/// A cached DNS reply together with its key and insertion time.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: u32,
    pub created_at: SystemTime,
    pub msg: Message,
}

impl Entry {
    /// Packs the entry into its line format:
    /// `<key_decimal> <created_at_unix_secs> <message_hex>`.
    pub fn pack(&self) -> Result<String> {
        let secs = match self.created_at.duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_secs() as i64,
            Err(before) => -(before.duration().as_secs() as i64),
        };
        let data = self.msg.to_vec().context("pack dns message")?;
        Ok(format!("{} {} {}", self.key, secs, hex::encode(data)))
    }

    /// Parses a packed entry. Fields beyond the third are reserved and
    /// ignored; fewer than three fields is an error.
    pub fn unpack(line: &str) -> Result<Entry> {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(secs), Some(data)) = (fields.next(), fields.next(), fields.next())
        else {
            anyhow::bail!("invalid number of fields: {line:?}");
        };
        let key: u32 = key.parse().context("parse cache key")?;
        let secs: i64 = secs.parse().context("parse creation time")?;
        let created_at = if secs >= 0 {
            UNIX_EPOCH + Duration::from_secs(secs as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
        };
        let data = hex::decode(data).context("decode dns message")?;
        let msg = Message::from_bytes(&data).context("unpack dns message")?;
        Ok(Entry {
            key,
            created_at,
            msg,
        })
    }
}

/// Sink and source for persisted cache entries. Every write the cache
/// performs is forwarded here; implementations log their own failures and
/// never surface them into the request path.
pub trait Backend: Send + Sync {
    fn set(&self, key: u32, entry: &Entry);
    fn evict(&self, key: u32);
    /// Returns all persisted entries, oldest insertion first.
    fn read(&self) -> Vec<Entry>;
    fn reset(&self);
}

/// Backend used when persistence is off: accepts every write, reads nothing.
#[derive(Debug, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn set(&self, _key: u32, _entry: &Entry) {}
    fn evict(&self, _key: u32) {}
    fn read(&self) -> Vec<Entry> {
        Vec::new()
    }
    fn reset(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub capacity: usize,
    pub size: usize,
    pub pending_tasks: usize,
}

enum Task {
    Evict(u32),
    Refresh(u32, Box<Message>),
}

type NowFn = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Fixed-capacity DNS reply cache.
///
/// Replies are keyed by [`fingerprint`] and evicted FIFO by insertion order
/// once the capacity is reached. Expired entries are either evicted in the
/// background, or, when a resolver [`Client`] is attached, served stale and
/// refreshed off the request path.
pub struct Cache {
    inner: Arc<Inner>,
    tasks: mpsc::Sender<Task>,
    closed: AtomicBool,
}

struct Inner {
    capacity: usize,
    client: Option<Client>,
    now: NowFn,
    refresh_id: AtomicU16,
    state: RwLock<State>,
    pending: AtomicUsize,
    drained: Notify,
}

struct State {
    values: HashMap<u32, Entry>,
    keys: VecDeque<u32>,
    backend: Arc<dyn Backend>,
}

impl Cache {
    /// Creates a cache without persistence. With a client attached, expired
    /// entries are refreshed in the background instead of evicted.
    pub fn new(capacity: usize, client: Option<Client>) -> Self {
        Self::with_backend(capacity, client, Arc::new(NullBackend))
    }

    /// Creates a cache pre-populated from `backend`; subsequent writes are
    /// mirrored to it. A capacity of zero disables caching entirely and
    /// clears the backend.
    pub fn with_backend(capacity: usize, client: Option<Client>, backend: Arc<dyn Backend>) -> Self {
        Self::with_now(capacity, client, backend, Arc::new(SystemTime::now))
    }

    fn with_now(
        capacity: usize,
        client: Option<Client>,
        backend: Arc<dyn Backend>,
        now: NowFn,
    ) -> Self {
        let mut state = State {
            values: HashMap::with_capacity(capacity),
            keys: VecDeque::with_capacity(capacity),
            backend: Arc::new(NullBackend),
        };
        load(&mut state, backend, capacity);
        let inner = Arc::new(Inner {
            capacity,
            client,
            now,
            refresh_id: AtomicU16::new(1),
            state: RwLock::new(state),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        let (tasks, task_rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
        tokio::spawn(run_tasks(Arc::clone(&inner), task_rx));
        Cache {
            inner,
            tasks,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the reply stored under `key`, if any.
    ///
    /// An expired entry is served stale when prefetching is on (a refresh is
    /// queued in the background); otherwise it is reported as a miss and
    /// queued for eviction.
    pub fn get(&self, key: u32) -> Option<Message> {
        let state = self.inner.read_state();
        let entry = state.values.get(&key)?;
        if self.is_expired(entry) {
            if self.inner.client.is_none() {
                self.enqueue(Task::Evict(key));
                return None;
            }
            // 先回旧值，后台刷新 / serve stale, refresh off the request path
            self.enqueue(Task::Refresh(key, Box::new(entry.msg.clone())));
        }
        Some(entry.msg.clone())
    }

    /// Stores `msg` under `key`. Messages with a zero minimum TTL or an rcode
    /// other than NOERROR/NXDOMAIN are not cacheable and are dropped.
    /// Inserting into a full cache evicts the oldest entry first.
    pub fn set(&self, key: u32, msg: Message) -> bool {
        let entry = Entry {
            key,
            created_at: (self.inner.now)(),
            msg,
        };
        self.inner.write_state().set(entry, self.inner.capacity)
    }

    /// Returns up to `n` entries, most recent insertion first. The result is
    /// a snapshot: later cache mutations do not affect it.
    pub fn list(&self, n: usize) -> Vec<Entry> {
        let state = self.inner.read_state();
        state
            .keys
            .iter()
            .rev()
            .take(n)
            .filter_map(|key| state.values.get(key).cloned())
            .collect()
    }

    pub fn stats(&self) -> Stats {
        let state = self.inner.read_state();
        Stats {
            capacity: self.inner.capacity,
            size: state.values.len(),
            pending_tasks: self.inner.pending.load(Ordering::Acquire),
        }
    }

    /// Removes every entry, in memory and in the backend.
    pub fn reset(&self) {
        let mut state = self.inner.write_state();
        state.values.clear();
        state.keys.clear();
        state.backend.reset();
    }

    /// Waits for all queued background tasks to finish. Close is terminal:
    /// tasks enqueued afterwards are silently dropped.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        (self.inner.now)() > entry.created_at + min_ttl(&entry.msg)
    }

    fn enqueue(&self, task: Task) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        if self.tasks.try_send(task).is_err() {
            // Queue saturated or worker gone; the next read repeats the same
            // transition, so the task can be dropped.
            warn!(
                event = "cache_task_dropped",
                "background queue full, dropping task"
            );
            self.inner.task_done();
        }
    }
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        // A poisoned lock still guards consistent state; take the guard.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn refresh(&self, key: u32, old: Message) {
        let Some(client) = &self.client else { return };
        let Some(question) = old.queries().first() else {
            return;
        };
        let mut query = Message::new();
        query.set_id(self.refresh_id.fetch_add(1, Ordering::Relaxed));
        query.set_recursion_desired(true);
        query.add_query(question.clone());
        let reply = match client.exchange(&query).await {
            Ok(reply) => reply,
            Err(err) => {
                // Entry stays in place; the next read retries the refresh.
                debug!(event = "cache_refresh_failed", key, error = %err, "refresh failed");
                return;
            }
        };
        let entry = Entry {
            key,
            created_at: (self.now)(),
            msg: reply,
        };
        let mut state = self.write_state();
        if !state.set(entry, self.capacity) {
            state.evict(key);
        }
    }
}

impl State {
    fn set(&mut self, entry: Entry, capacity: usize) -> bool {
        if capacity == 0 || !cacheable(&entry.msg) {
            return false;
        }
        if self.values.len() == capacity {
            if let Some(head) = self.keys.pop_front() {
                self.values.remove(&head);
                self.backend.evict(head);
            }
        }
        self.append_key(entry.key);
        self.backend.set(entry.key, &entry);
        self.values.insert(entry.key, entry);
        true
    }

    fn evict(&mut self, key: u32) {
        self.values.remove(&key);
        self.remove_key(key);
        self.backend.evict(key);
    }

    /// Appends the key to the tail of the insertion log, dropping any earlier
    /// occurrence so the log never holds duplicates.
    fn append_key(&mut self, key: u32) {
        self.remove_key(key);
        self.keys.push_back(key);
    }

    fn remove_key(&mut self, key: u32) {
        self.keys.retain(|k| *k != key);
    }
}

/// Pre-populates `state` from the backend, keeping the newest entries that
/// fit within `capacity` and evicting the remainder from the backend. The
/// backend is only attached afterwards, so loading does not write back.
fn load(state: &mut State, backend: Arc<dyn Backend>, capacity: usize) {
    if capacity == 0 {
        backend.reset();
        return;
    }
    let values = backend.read();
    let excess = values.len().saturating_sub(capacity);
    for value in &values[..excess] {
        backend.evict(value.key);
    }
    for value in values.into_iter().skip(excess) {
        state.set(value, capacity);
    }
    state.backend = backend;
}

async fn run_tasks(inner: Arc<Inner>, mut tasks: mpsc::Receiver<Task>) {
    while let Some(task) = tasks.recv().await {
        match task {
            Task::Evict(key) => inner.write_state().evict(key),
            Task::Refresh(key, old) => inner.refresh(key, *old).await,
        }
        inner.task_done();
    }
}
