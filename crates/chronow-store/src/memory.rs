//! In-process hot store: the native streaming-log engine.
//!
//! This is the fast backend. Logs, consumer groups, keyed values, hashes,
//! and sorted sets live in process memory behind one state lock; blocking
//! group reads park on a per-log [`Notify`] and wake on append instead of
//! polling. Reclaim is native: the engine tracks delivery timestamps and
//! transfers entries whose idle time exceeded the caller's threshold.
//!
//! State does not survive the process. Deployments that need restart
//! durability for the hot tier use the portable backend
//! ([`crate::SqliteHotStore`]) instead; the broker semantics are identical.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration, Instant};

use crate::error::{Result, StoreError};
use crate::{format_entry_id, now_ms, parse_entry_id, HotStore, LogEntry, LogInfo, PendingEntry};
use crate::{RANGE_MAX, RANGE_MIN};

/// In-process [`HotStore`] implementation.
///
/// Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct MemoryHotStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<HashMap<String, Keyed>>,
    closed: AtomicBool,
}

enum Keyed {
    Str {
        value: Bytes,
        expires_at: Option<i64>,
    },
    Hash {
        fields: HashMap<String, String>,
        expires_at: Option<i64>,
    },
    Zset {
        members: HashMap<String, i64>,
    },
    Log(LogState),
}

impl Keyed {
    fn expired(&self, now: i64) -> bool {
        let expires_at = match self {
            Keyed::Str { expires_at, .. } | Keyed::Hash { expires_at, .. } => *expires_at,
            _ => None,
        };
        matches!(expires_at, Some(at) if at <= now)
    }
}

#[derive(Default)]
struct LogState {
    entries: VecDeque<StoredEntry>,
    last_ms: i64,
    last_seq: u64,
    groups: HashMap<String, GroupState>,
    notify: Arc<Notify>,
}

struct StoredEntry {
    ms: i64,
    seq: u64,
    fields: HashMap<String, String>,
}

struct GroupState {
    /// Highest `(ms, seq)` handed out as a first delivery.
    last_delivered: (i64, u64),
    pending: HashMap<String, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: i64,
    deliveries: u64,
}

impl MemoryHotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, Keyed>> {
        self.inner.state.lock().expect("hot store state lock poisoned")
    }

    /// Fetch a live (non-expired) entry, removing it lazily when expired.
    fn live_entry<'a>(
        state: &'a mut HashMap<String, Keyed>,
        key: &str,
        now: i64,
    ) -> Option<&'a mut Keyed> {
        if state.get(key).is_some_and(|k| k.expired(now)) {
            state.remove(key);
            return None;
        }
        state.get_mut(key)
    }

    fn log_mut<'a>(
        state: &'a mut HashMap<String, Keyed>,
        log: &str,
    ) -> Result<Option<&'a mut LogState>> {
        match state.get_mut(log) {
            Some(Keyed::Log(log_state)) => Ok(Some(log_state)),
            Some(_) => Err(StoreError::WrongKind {
                key: log.to_string(),
            }),
            None => Ok(None),
        }
    }

    fn log_or_create<'a>(
        state: &'a mut HashMap<String, Keyed>,
        log: &str,
    ) -> Result<&'a mut LogState> {
        if !state.contains_key(log) {
            state.insert(log.to_string(), Keyed::Log(LogState::default()));
        }
        match state.get_mut(log) {
            Some(Keyed::Log(log_state)) => Ok(log_state),
            _ => Err(StoreError::WrongKind {
                key: log.to_string(),
            }),
        }
    }

    /// Hand out never-delivered entries and mark them in flight.
    fn read_new(
        log_state: &mut LogState,
        log: &str,
        group: &str,
        consumer: &str,
        count: usize,
        now: i64,
    ) -> Result<Vec<LogEntry>> {
        let LogState {
            entries, groups, ..
        } = log_state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StoreError::GroupNotFound {
                log: log.to_string(),
                group: group.to_string(),
            })?;

        let start = entries.partition_point(|e| (e.ms, e.seq) <= group_state.last_delivered);
        let mut out = Vec::new();
        for entry in entries.iter().skip(start).take(count) {
            let id = format_entry_id(entry.ms, entry.seq);
            group_state.pending.insert(
                id.clone(),
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            group_state.last_delivered = (entry.ms, entry.seq);
            out.push(LogEntry {
                id,
                fields: entry.fields.clone(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn ping(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Advisory for the in-process engine: marks the store closed so `ping`
    /// fails fast. State is dropped with the last clone.
    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn kv_set(&self, key: &str, value: Bytes, ttl_sec: Option<u64>) -> Result<()> {
        let expires_at = ttl_sec.map(|s| now_ms() + (s as i64) * 1_000);
        self.state()
            .insert(key.to_string(), Keyed::Str { value, expires_at });
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = now_ms();
        let mut state = self.state();
        match Self::live_entry(&mut state, key, now) {
            Some(Keyed::Str { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn kv_del(&self, keys: &[&str]) -> Result<u64> {
        let now = now_ms();
        let mut state = self.state();
        let mut removed = 0;
        for key in keys {
            if let Some(keyed) = state.remove(*key) {
                if !keyed.expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn kv_exists(&self, keys: &[&str]) -> Result<u64> {
        let now = now_ms();
        let mut state = self.state();
        let mut present = 0;
        for key in keys {
            if Self::live_entry(&mut state, key, now).is_some() {
                present += 1;
            }
        }
        Ok(present)
    }

    async fn kv_expire(&self, key: &str, ttl_sec: u64) -> Result<bool> {
        let now = now_ms();
        let mut state = self.state();
        match Self::live_entry(&mut state, key, now) {
            Some(Keyed::Str { expires_at, .. }) | Some(Keyed::Hash { expires_at, .. }) => {
                *expires_at = Some(now + (ttl_sec as i64) * 1_000);
                Ok(true)
            }
            Some(_) => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
            None => Ok(false),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let now = now_ms();
        let mut state = self.state();
        if Self::live_entry(&mut state, key, now).is_none() {
            state.insert(
                key.to_string(),
                Keyed::Hash {
                    fields: HashMap::new(),
                    expires_at: None,
                },
            );
        }
        match state.get_mut(key) {
            Some(Keyed::Hash { fields, .. }) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let now = now_ms();
        let mut state = self.state();
        match Self::live_entry(&mut state, key, now) {
            Some(Keyed::Hash { fields, .. }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn log_append(
        &self,
        log: &str,
        fields: &HashMap<String, String>,
        max_len: u64,
    ) -> Result<String> {
        let now = now_ms();
        let notify;
        let id;
        {
            let mut state = self.state();
            let log_state = Self::log_or_create(&mut state, log)?;

            // Ids must increase even when the wall clock stalls or steps back.
            let (ms, seq) = if now > log_state.last_ms {
                (now, 0)
            } else {
                (log_state.last_ms, log_state.last_seq + 1)
            };
            log_state.last_ms = ms;
            log_state.last_seq = seq;
            id = format_entry_id(ms, seq);

            log_state.entries.push_back(StoredEntry {
                ms,
                seq,
                fields: fields.clone(),
            });
            while log_state.entries.len() as u64 > max_len {
                log_state.entries.pop_front();
            }
            notify = log_state.notify.clone();
        }
        notify.notify_waiters();
        Ok(id)
    }

    async fn log_len(&self, log: &str) -> Result<u64> {
        let mut state = self.state();
        Ok(Self::log_mut(&mut state, log)?
            .map(|l| l.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn log_range(
        &self,
        log: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let start_key = if start == RANGE_MIN {
            (i64::MIN, u64::MIN)
        } else {
            parse_entry_id(start).unwrap_or((i64::MIN, u64::MIN))
        };
        let end_key = if end == RANGE_MAX {
            (i64::MAX, u64::MAX)
        } else {
            parse_entry_id(end).unwrap_or((i64::MAX, u64::MAX))
        };

        let mut state = self.state();
        let Some(log_state) = Self::log_mut(&mut state, log)? else {
            return Ok(Vec::new());
        };
        Ok(log_state
            .entries
            .iter()
            .filter(|e| (e.ms, e.seq) >= start_key && (e.ms, e.seq) <= end_key)
            .take(count)
            .map(|e| LogEntry {
                id: format_entry_id(e.ms, e.seq),
                fields: e.fields.clone(),
            })
            .collect())
    }

    async fn log_info(&self, log: &str) -> Result<LogInfo> {
        let mut state = self.state();
        Ok(Self::log_mut(&mut state, log)?
            .map(|l| LogInfo {
                length: l.entries.len() as u64,
                groups: l.groups.len() as u64,
            })
            .unwrap_or(LogInfo {
                length: 0,
                groups: 0,
            }))
    }

    async fn group_create(&self, log: &str, group: &str, start_id: &str) -> Result<()> {
        let mut state = self.state();
        let log_state = Self::log_or_create(&mut state, log)?;
        if log_state.groups.contains_key(group) {
            return Err(StoreError::GroupAlreadyExists {
                log: log.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = match start_id {
            "$" => (log_state.last_ms, log_state.last_seq),
            "0" => (0, 0),
            other => parse_entry_id(other).unwrap_or((0, 0)),
        };
        log_state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn group_destroy(&self, log: &str, group: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(log_state) = Self::log_mut(&mut state, log)? {
            log_state.groups.remove(group);
        }
        Ok(())
    }

    async fn group_read(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notify = {
                let mut state = self.state();
                match Self::log_mut(&mut state, log)? {
                    Some(log_state) => log_state.notify.clone(),
                    None => {
                        return Err(StoreError::GroupNotFound {
                            log: log.to_string(),
                            group: group.to_string(),
                        })
                    }
                }
            };

            // Register interest before the read so an append racing with the
            // empty check still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = {
                let now = now_ms();
                let mut state = self.state();
                match Self::log_mut(&mut state, log)? {
                    Some(log_state) => Self::read_new(log_state, log, group, consumer, count, now)?,
                    None => Vec::new(),
                }
            };
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = timeout(deadline - now, notified).await;
        }
    }

    async fn group_ack(&self, log: &str, group: &str, ids: &[&str]) -> Result<u64> {
        let mut state = self.state();
        let Some(log_state) = Self::log_mut(&mut state, log)? else {
            return Ok(0);
        };
        let Some(group_state) = log_state.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(*id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn group_reclaim(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let now = now_ms();
        let mut state = self.state();
        let Some(log_state) = Self::log_mut(&mut state, log)? else {
            return Ok(Vec::new());
        };
        let LogState {
            entries, groups, ..
        } = log_state;
        let Some(group_state) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut expired: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now - p.delivered_at >= min_idle_ms as i64)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort_by_key(|id| parse_entry_id(id).unwrap_or((0, 0)));
        expired.truncate(count);

        let mut out = Vec::new();
        for id in expired {
            let key = parse_entry_id(&id).unwrap_or((0, 0));
            let idx = entries.partition_point(|e| (e.ms, e.seq) < key);
            let found = entries.get(idx).filter(|e| (e.ms, e.seq) == key);
            match (found, group_state.pending.get_mut(&id)) {
                (Some(entry), Some(pending)) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    out.push(LogEntry {
                        id,
                        fields: entry.fields.clone(),
                    });
                }
                // Entry was trimmed away; drop the dangling in-flight record.
                _ => {
                    group_state.pending.remove(&id);
                }
            }
        }
        Ok(out)
    }

    async fn group_pending(
        &self,
        log: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let now = now_ms();
        let mut state = self.state();
        let Some(log_state) = Self::log_mut(&mut state, log)? else {
            return Ok(Vec::new());
        };
        let Some(group_state) = log_state.groups.get(group) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle_ms: (now - p.delivered_at).max(0) as u64,
                deliveries: p.deliveries,
            })
            .collect();
        out.sort_by_key(|p| parse_entry_id(&p.id).unwrap_or((0, 0)));
        out.truncate(count);
        Ok(out)
    }

    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let mut state = self.state();
        if !state.contains_key(key) {
            state.insert(
                key.to_string(),
                Keyed::Zset {
                    members: HashMap::new(),
                },
            );
        }
        match state.get_mut(key) {
            Some(Keyed::Zset { members }) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
        }
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state();
        let members = match state.get(key) {
            Some(Keyed::Zset { members }) => members,
            Some(_) => {
                return Err(StoreError::WrongKind {
                    key: key.to_string(),
                })
            }
            None => return Ok(Vec::new()),
        };
        let mut scored: Vec<(i64, &String)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member))
            .collect();
        scored.sort();
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn zset_remove(&self, key: &str, members: &[&str]) -> Result<u64> {
        let mut state = self.state();
        match state.get_mut(key) {
            Some(Keyed::Zset {
                members: existing, ..
            }) => {
                let mut removed = 0;
                for member in members {
                    if existing.remove(*member).is_some() {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            Some(_) => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
            None => Ok(0),
        }
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        let state = self.state();
        match state.get(key) {
            Some(Keyed::Zset { members }) => Ok(members.len() as u64),
            Some(_) => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
            None => Ok(0),
        }
    }
}
