use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use super::{BatchOp, EntryId, Fields, ReadMode, Store, StreamEntry};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Group {
    /// Highest entry handed to any consumer of the group
    last_delivered: Option<EntryId>,
    /// Delivered but unacknowledged entries and their consumer
    pending: BTreeMap<EntryId, String>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    kv: HashMap<String, Vec<u8>>,
    streams: HashMap<String, Stream>,
    leases: HashMap<String, Lease>,
    last_id: Option<EntryId>,
}

impl Inner {
    fn next_id(&mut self) -> EntryId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let id = match self.last_id {
            Some(last) if millis <= last.millis => EntryId {
                millis: last.millis,
                seq: last.seq + 1,
            },
            _ => EntryId { millis, seq: 0 },
        };
        self.last_id = Some(id);
        id
    }

    fn append(&mut self, stream: &str, fields: Fields) -> EntryId {
        let id = self.next_id();
        self.streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(StreamEntry { id, fields });
        id
    }

    fn ack(&mut self, stream: &str, group: &str, id: EntryId) -> bool {
        self.streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn read(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        mode: ReadMode,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let stream_state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::NoSuchGroup(group.to_string()))?;
        let Stream { entries, groups } = stream_state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StoreError::NoSuchGroup(group.to_string()))?;

        match mode {
            ReadMode::Pending => {
                let ids: Vec<EntryId> = group_state
                    .pending
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == consumer)
                    .map(|(id, _)| *id)
                    .take(count)
                    .collect();
                Ok(entries
                    .iter()
                    .filter(|e| ids.contains(&e.id))
                    .cloned()
                    .collect())
            }
            ReadMode::New => {
                let fresh: Vec<StreamEntry> = entries
                    .iter()
                    .filter(|e| group_state.last_delivered.map_or(true, |last| e.id > last))
                    .take(count)
                    .cloned()
                    .collect();
                for entry in &fresh {
                    group_state.pending.insert(entry.id, consumer.to_string());
                    group_state.last_delivered = Some(entry.id);
                }
                Ok(fresh)
            }
        }
    }
}

/// In-process [`Store`] with Redis-like stream and consumer group semantics
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Bumped on every append so blocking reads can wake up
    appended: watch::Sender<u64>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            appended,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of entries ever appended to a stream
    pub async fn stream_len(&self, stream: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// All entries of a stream, oldest first
    pub async fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Number of delivered but unacknowledged entries in a group
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Current holder of a lease, if it has not expired
    pub async fn lease_holder(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .leases
            .get(key)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.holder.clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn notify_append(&self) {
        self.appended.send_modify(|n| *n = n.wrapping_add(1));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        Ok(self.inner.lock().await.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.lock().await.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, StoreError> {
        self.check_available()?;
        let id = self.inner.lock().await.append(stream, fields);
        self.notify_append();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let stream_state = inner.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Err(StoreError::GroupExists(group.to_string()));
        }
        stream_state
            .groups
            .insert(group.to_string(), Group::default());
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        mode: ReadMode,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = Instant::now() + block;
        // Subscribe before the first read so an append between the read and
        // the wait still wakes us.
        let mut appended = self.appended.subscribe();

        loop {
            self.check_available()?;
            let entries = self
                .inner
                .lock()
                .await
                .read(stream, group, consumer, mode, count)?;

            if !entries.is_empty() || mode == ReadMode::Pending {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            match tokio::time::timeout(deadline - now, appended.changed()).await {
                Ok(Ok(())) => continue,
                _ => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.inner.lock().await.ack(stream, group, id))
    }

    async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut appended = false;
        {
            let mut inner = self.inner.lock().await;
            for op in ops {
                match op {
                    BatchOp::Set { key, value } => {
                        inner.kv.insert(key, value);
                    }
                    BatchOp::Append { stream, fields } => {
                        inner.append(&stream, fields);
                        appended = true;
                    }
                    BatchOp::Ack { stream, group, id } => {
                        inner.ack(&stream, &group, id);
                    }
                }
            }
        }
        if appended {
            self.notify_append();
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let free = match inner.leases.get(key) {
            Some(lease) => lease.holder == holder || lease.expires_at <= now,
            None => true,
        };
        if free {
            inner.leases.insert(
                key.to_string(),
                Lease {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(free)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.leases.get(key) {
            Some(lease) if lease.holder == holder => {
                inner.leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
