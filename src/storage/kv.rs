//! The data store: a single namespace of keys that can hold either a string or a stream,
//! with lazy (and, following the reference `ExpiringHashMap`, also proactively
//! background-swept) millisecond expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::stream::{Field, IdSpec, RangeBound, StreamData, StreamEntry, StreamError, StreamId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug)]
enum EntryData {
    Str(Vec<u8>),
    Stream(StreamData),
}

#[derive(Debug)]
struct Entry {
    data: EntryData,
    #[allow(dead_code)] // retained for parity with the data model; not currently queried
    created_at: Instant,
    expire_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expire_at, Some(at) if now > at)
    }

    fn kind_name(&self) -> &'static str {
        match self.data {
            EntryData::Str(_) => "string",
            EntryData::Stream(_) => "stream",
        }
    }
}

#[derive(Default)]
pub struct Store {
    entries: HashMap<Vec<u8>, Entry>,
    /// Lazily created, never torn down: a small, bounded-in-practice amount of memory kept
    /// alive per stream key ever read with a blocking XREAD, in exchange for not having to
    /// reason about a waiter racing the removal of its notifier.
    waiters: HashMap<Vec<u8>, Arc<Notify>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any entry under `key` whose expiry has passed. Returns `true` if the key is
    /// absent after this call (either it never existed or it just expired).
    fn sweep(&mut self, key: &[u8], now: Instant) -> bool {
        let expired = self.entries.get(key).is_some_and(|e| e.is_expired(now));
        if expired {
            self.entries.remove(key);
        }
        !self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8], expire_at: Option<Instant>) -> Result<()> {
        let now = Instant::now();
        self.sweep(key, now);
        if let Some(existing) = self.entries.get(key) {
            if matches!(existing.data, EntryData::Stream(_)) {
                return Err(StoreError::WrongType);
            }
        }
        self.entries.insert(
            key.to_vec(),
            Entry {
                data: EntryData::Str(value.to_vec()),
                created_at: now,
                expire_at,
            },
        );
        Ok(())
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        if self.sweep(key, now) {
            return Ok(None);
        }
        match &self.entries[key].data {
            EntryData::Str(value) => Ok(Some(value.clone())),
            EntryData::Stream(_) => Err(StoreError::WrongType),
        }
    }

    pub fn type_of(&mut self, key: &[u8]) -> &'static str {
        let now = Instant::now();
        if self.sweep(key, now) {
            return "none";
        }
        self.entries[key].kind_name()
    }

    /// All live keys, expiry-checked in one pass, in a deterministic (sorted) order.
    pub fn keys_all(&mut self) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let expired: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
        }
        let mut keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn xadd(
        &mut self,
        key: &[u8],
        id_spec: &IdSpec,
        fields: Vec<Field>,
        now_ms: u64,
    ) -> Result<StreamId> {
        let now = Instant::now();
        self.sweep(key, now);
        let entry = self.entries.entry(key.to_vec()).or_insert_with(|| Entry {
            data: EntryData::Stream(StreamData::default()),
            created_at: now,
            expire_at: None,
        });
        let stream = match &mut entry.data {
            EntryData::Stream(stream) => stream,
            EntryData::Str(_) => return Err(StoreError::WrongType),
        };
        let id = stream.resolve_id(id_spec, now_ms)?;
        stream.append(id, fields);
        Ok(id)
    }

    pub fn xrange(
        &mut self,
        key: &[u8],
        start: RangeBound,
        end: RangeBound,
    ) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        if self.sweep(key, now) {
            return Ok(Vec::new());
        }
        match &self.entries[key].data {
            EntryData::Stream(stream) => Ok(stream.range(start, end)),
            EntryData::Str(_) => Err(StoreError::WrongType),
        }
    }

    pub fn xread_snapshot(&mut self, key: &[u8], start: StreamId) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        if self.sweep(key, now) {
            return Ok(Vec::new());
        }
        match &self.entries[key].data {
            EntryData::Stream(stream) => Ok(stream.after(start)),
            EntryData::Str(_) => Err(StoreError::WrongType),
        }
    }

    /// The stream's current top ID, used to resolve an XREAD `$` start at call time.
    pub fn stream_top(&mut self, key: &[u8]) -> Result<StreamId> {
        let now = Instant::now();
        if self.sweep(key, now) {
            return Ok(StreamId::ZERO);
        }
        match &self.entries[key].data {
            EntryData::Stream(stream) => Ok(stream.top().unwrap_or(StreamId::ZERO)),
            EntryData::Str(_) => Err(StoreError::WrongType),
        }
    }

    /// Get-or-create the notifier woken by every successful XADD against `key`.
    pub fn notifier_for(&mut self, key: &[u8]) -> Arc<Notify> {
        self.waiters
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify_waiters(&self, key: &[u8]) {
        if let Some(notify) = self.waiters.get(key) {
            notify.notify_waiters();
        }
    }

    /// Wrapper used by the dispatcher so a successful XADD wakes any blocked XREAD in the
    /// same lock acquisition that appended the entry.
    pub fn xadd_and_notify(
        &mut self,
        key: &[u8],
        id_spec: &IdSpec,
        fields: Vec<Field>,
        now_ms: u64,
    ) -> Result<StreamId> {
        let id = self.xadd(key, id_spec, fields, now_ms)?;
        self.notify_waiters(key);
        Ok(id)
    }

    /// Load string entries recovered from a snapshot file. Existing keys are left alone —
    /// this only ever runs once, at startup, before any client connects. `now_ms` is the
    /// current Unix epoch time, needed because a snapshot's expiry is an absolute timestamp
    /// and has to be converted to a remaining-duration-from-now before it fits `Instant`.
    pub fn load_snapshot(&mut self, entries: HashMap<Vec<u8>, (Vec<u8>, Option<u64>)>, now_ms: u64) {
        let now = Instant::now();
        for (key, (value, expire_at_ms)) in entries {
            if let Some(at_ms) = expire_at_ms {
                if at_ms <= now_ms {
                    continue;
                }
            }
            let expire_at = expire_at_ms.map(|at_ms| {
                now.checked_add(Duration::from_millis(at_ms - now_ms))
                    .unwrap_or(now)
            });
            self.entries.insert(
                key,
                Entry {
                    data: EntryData::Str(value),
                    created_at: now,
                    expire_at,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::stream::IdSpec;

    #[test]
    fn get_after_ttl_expiry_returns_none_and_clears_entry() {
        let mut store = Store::new();
        store
            .set(b"foo", b"bar", Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();
        assert_eq!(store.get(b"foo").unwrap(), None);
        assert_eq!(store.type_of(b"foo"), "none");
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut store = Store::new();
        store.set(b"foo", b"bar", None).unwrap();
        assert_eq!(store.get(b"foo").unwrap(), Some(b"bar".to_vec()));
        assert_eq!(store.type_of(b"foo"), "string");
    }

    #[test]
    fn set_on_existing_stream_key_fails() {
        let mut store = Store::new();
        store
            .xadd(b"s", &IdSpec::Explicit(StreamId::new(1, 1)), vec![], 0)
            .unwrap();
        assert_eq!(store.set(b"s", b"x", None), Err(StoreError::WrongType));
    }

    #[test]
    fn xadd_on_existing_string_key_fails() {
        let mut store = Store::new();
        store.set(b"s", b"x", None).unwrap();
        assert_eq!(
            store.xadd(b"s", &IdSpec::AutoBoth, vec![], 10),
            Err(StoreError::WrongType)
        );
    }

    #[test]
    fn keys_all_skips_expired_entries() {
        let mut store = Store::new();
        store.set(b"live", b"1", None).unwrap();
        store
            .set(b"dead", b"1", Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();
        assert_eq!(store.keys_all(), vec![b"live".to_vec()]);
    }
}
