//! In-memory stream broker for tests/dev.
//!
//! Mirrors the consumer-group behaviour the bus relies on:
//! - entry ids are `<seq>-0`, strictly increasing per stream
//! - each group tracks its last delivered id and a pending-entries list
//! - a pending entry is owned by the consumer it was delivered to
//!
//! Failure injection (`set_offline`, `fail_next_appends`, `fail_next_acks`,
//! `InMemoryConnector::fail_next_connects`) lets tests drive the retry,
//! reconnect and dead-letter paths without a real server.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use agilebus_events::RecordFields;

use super::{
    BrokerConnector, BrokerError, GroupReader, GroupSetup, ReadFrom, StreamBroker, StreamEntry,
    StreamStats,
};

#[derive(Debug, Default)]
struct StreamLog {
    next_seq: u64,
    entries: Vec<(u64, RecordFields)>,
    groups: BTreeMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
    consumers: BTreeSet<String>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Inner {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
    offline: AtomicBool,
    failing_appends: AtomicU32,
    failing_acks: AtomicU32,
}

/// In-memory broker. Clones share the same underlying streams.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a transport outage: every operation fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `n` appends (on any stream) fail with a connection error.
    pub fn fail_next_appends(&self, n: u32) {
        self.inner.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` acknowledgements fail with a connection error.
    pub fn fail_next_acks(&self, n: u32) {
        self.inner.failing_acks.store(n, Ordering::SeqCst);
    }

    /// Number of entries delivered to `group` but not yet acknowledged.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|streams| {
                streams
                    .get(stream)
                    .and_then(|log| log.groups.get(group))
                    .map(|g| g.pending.len())
            })
            .unwrap_or(0)
    }

    /// Number of records in `stream` (0 when it does not exist).
    pub fn stream_len(&self, stream: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|streams| streams.get(stream).map(|log| log.entries.len()))
            .unwrap_or(0)
    }

    /// How often the pending entry `id` has been delivered in `group`.
    pub fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u32> {
        let seq = parse_seq(id)?;
        let streams = self.lock().ok()?;
        let pending = streams.get(stream)?.groups.get(group)?.pending.get(&seq)?;
        Some(pending.deliveries)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StreamLog>>, BrokerError> {
        self.inner
            .streams
            .lock()
            .map_err(|_| BrokerError::Command("lock poisoned".to_string()))
    }

    fn check_online(&self) -> Result<(), BrokerError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker offline".to_string()));
        }
        Ok(())
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.check_online()?;
        let mut streams = self.lock()?;

        let nogroup = || {
            BrokerError::Command(format!(
                "NOGROUP no such key '{stream}' or consumer group '{group}'"
            ))
        };
        let log = streams.get_mut(stream).ok_or_else(nogroup)?;
        let StreamLog { entries, groups, .. } = log;
        let state = groups.get_mut(group).ok_or_else(nogroup)?;
        state.consumers.insert(consumer.to_string());

        let mut batch = Vec::new();
        match from {
            ReadFrom::New => {
                let after = state.last_delivered;
                for (seq, fields) in entries
                    .iter()
                    .filter(|(seq, _)| *seq > after)
                    .take(count)
                {
                    state.last_delivered = *seq;
                    state.pending.insert(
                        *seq,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            deliveries: 1,
                        },
                    );
                    batch.push(StreamEntry {
                        id: format_id(*seq),
                        fields: fields.clone(),
                    });
                }
            }
            ReadFrom::Pending => {
                for (seq, pending) in state
                    .pending
                    .iter_mut()
                    .filter(|(_, p)| p.consumer == consumer)
                    .take(count)
                {
                    pending.deliveries += 1;
                    let fields = entries
                        .binary_search_by_key(seq, |(s, _)| *s)
                        .map(|idx| entries[idx].1.clone())
                        .unwrap_or_default();
                    batch.push(StreamEntry {
                        id: format_id(*seq),
                        fields,
                    });
                }
            }
        }

        Ok(batch)
    }
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split_once('-').map_or(id, |(ms, _)| ms).parse().ok()
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check_online()
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupSetup, BrokerError> {
        self.check_online()?;
        let mut streams = self.lock()?;
        let log = streams.entry(stream.to_string()).or_default();

        if log.groups.contains_key(group) {
            return Ok(GroupSetup::AlreadyExists);
        }
        log.groups.insert(group.to_string(), GroupState::default());
        Ok(GroupSetup::Created)
    }

    async fn append(&self, stream: &str, fields: &RecordFields) -> Result<String, BrokerError> {
        self.check_online()?;
        if Self::take_injected_failure(&self.inner.failing_appends) {
            return Err(BrokerError::Connection("injected append failure".to_string()));
        }

        let id = {
            let mut streams = self.lock()?;
            let log = streams.entry(stream.to_string()).or_default();
            log.next_seq += 1;
            log.entries.push((log.next_seq, fields.clone()));
            format_id(log.next_seq)
        };

        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        self.check_online()?;
        if Self::take_injected_failure(&self.inner.failing_acks) {
            return Err(BrokerError::Connection("injected ack failure".to_string()));
        }
        let mut streams = self.lock()?;
        let Some(state) = streams.get_mut(stream).and_then(|log| log.groups.get_mut(group)) else {
            return Ok(0);
        };

        let acked = ids
            .iter()
            .filter_map(|id| parse_seq(id))
            .filter(|seq| state.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn rev_range(
        &self,
        stream: &str,
        before: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.check_online()?;
        let upper = match before {
            Some(id) => parse_seq(id)
                .ok_or_else(|| BrokerError::Command(format!("invalid stream id {id:?}")))?,
            None => u64::MAX,
        };

        let streams = self.lock()?;
        let Some(log) = streams.get(stream) else {
            return Ok(Vec::new());
        };

        Ok(log
            .entries
            .iter()
            .rev()
            .filter(|(seq, _)| before.is_none() || *seq < upper)
            .take(count)
            .map(|(seq, fields)| StreamEntry {
                id: format_id(*seq),
                fields: fields.clone(),
            })
            .collect())
    }

    async fn stream_stats(&self, stream: &str) -> Result<StreamStats, BrokerError> {
        self.check_online()?;
        let streams = self.lock()?;
        let log = streams
            .get(stream)
            .ok_or_else(|| BrokerError::Command(format!("no such key '{stream}'")))?;

        Ok(StreamStats {
            stream_name: stream.to_string(),
            length: log.entries.len() as u64,
            groups: log.groups.len() as u64,
            consumers: log.groups.values().map(|g| g.consumers.len() as u64).sum(),
        })
    }

    async fn reader(&self) -> Result<Box<dyn GroupReader>, BrokerError> {
        self.check_online()?;
        Ok(Box::new(InMemoryReader {
            broker: self.clone(),
        }))
    }

    async fn close(&self) {}
}

struct InMemoryReader {
    broker: InMemoryBroker,
}

#[async_trait]
impl GroupReader for InMemoryReader {
    async fn read(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before looking, so an append between the
            // claim and the wait still wakes us.
            let appended = self.broker.inner.appended.notified();

            let batch = self.broker.claim(stream, group, consumer, from, count)?;
            if !batch.is_empty() || from == ReadFrom::Pending {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

/// Connector handing out handles to a shared [`InMemoryBroker`].
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    failing_connects: AtomicU32,
    connects: AtomicU32,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            failing_connects: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Successful connections handed out so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn StreamBroker>, BrokerError> {
        self.broker.check_online()?;
        if self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.broker.clone()))
    }
}
