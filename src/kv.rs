//! Expiring key/value store shared by every worker (§4.1).
//!
//! Grounded in the teacher's `storage::kv::KvStore` — same sharded
//! `parking_lot::RwLock<HashMap<..>>` discipline, same reader/writer
//! exclusion model — stripped of Parquet/bincode snapshot persistence, which
//! is an explicit Non-goal here (the KV store does not survive restarts).

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

/// Function pointer a native module may register to release a value it
/// allocated outside the Rust heap. Invoked at most once, on delete or
/// expiry. Script-originated values never carry one — `Drop` reclaims them.
pub type NativeFreeFn = unsafe extern "C" fn(*mut c_void);

#[derive(Clone)]
pub enum KvValue {
    Bytes(Vec<u8>),
    /// An opaque pointer owned by a native module, released via `free_fn`.
    Native {
        ptr: usize,
        free_fn: Option<NativeFreeFn>,
    },
}

impl KvValue {
    pub fn from_str(s: impl Into<String>) -> Self {
        KvValue::Bytes(s.into().into_bytes())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::Bytes(b) => std::str::from_utf8(b).ok(),
            KvValue::Native { .. } => None,
        }
    }
}

/// A value's free-function runs when the entry holding it is dropped, so a
/// racing delete and an expiry sweep can never invoke it twice: whichever
/// side actually removes the map entry is the one that owns the `Entry` and
/// therefore the one whose `Drop` fires.
struct Entry {
    value: KvValue,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let KvValue::Native {
            ptr,
            free_fn: Some(f),
        } = self.value
        {
            if ptr != 0 {
                unsafe { f(ptr as *mut c_void) };
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Replaced,
    Deleted,
    Rejected,
}

const N_SHARDS: usize = 16;

struct Shard {
    map: RwLock<HashMap<String, Entry>>,
}

/// Process-wide expiring KV store. Cheap to clone (an `Arc` of shards) so it
/// can be handed to every worker and to native modules via the `ModuleFacility`.
#[derive(Clone)]
pub struct KvStore {
    shards: Arc<Vec<Shard>>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        let shards = (0..N_SHARDS)
            .map(|_| Shard {
                map: RwLock::new(HashMap::new()),
            })
            .collect();
        Self {
            shards: Arc::new(shards),
        }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let idx = (xxh3_64(key.as_bytes()) as usize) & (N_SHARDS - 1);
        &self.shards[idx]
    }

    /// Read-only; never blocks on expired entries -- a get that lands on a
    /// stale entry removes it under the write lock and returns absent,
    /// rather than synthesising a value.
    pub fn get(&self, key: &str) -> Option<KvValue> {
        let shard = self.shard_for(key);
        {
            let r = shard.map.read();
            match r.get(key) {
                None => return None,
                Some(ent) => {
                    if !is_expired(ent) {
                        return Some(ent.value.clone());
                    }
                }
            }
        }
        // Expired: upgrade to a write lock and reclaim it. Re-check under the
        // write lock in case another worker already removed or replaced it.
        let mut w = shard.map.write();
        if let Some(ent) = w.get(key) {
            if is_expired(ent) {
                w.remove(key);
            } else {
                return Some(ent.value.clone());
            }
        }
        None
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Implements the §4.1 set-semantics table in full.
    pub fn set(
        &self,
        key: &str,
        value: Option<KvValue>,
        ttl_seconds: i64,
        nx: bool,
    ) -> SetOutcome {
        let shard = self.shard_for(key);
        let mut w = shard.map.write();
        let preexisting = w.get(key).map(|e| !is_expired(e)).unwrap_or(false);

        match (preexisting, value) {
            (false, None) => SetOutcome::Rejected,
            (false, Some(v)) => {
                let (ttl, expires_at) = ttl_fields(ttl_seconds);
                w.insert(
                    key.to_string(),
                    Entry {
                        value: v,
                        ttl,
                        expires_at,
                    },
                );
                SetOutcome::Inserted
            }
            (true, None) => {
                w.remove(key);
                SetOutcome::Deleted
            }
            (true, Some(_)) if nx => SetOutcome::Rejected,
            (true, Some(v)) => {
                let existing = w.get(key).expect("checked preexisting above");
                let (ttl, expires_at) = match ttl_seconds.cmp(&0) {
                    std::cmp::Ordering::Less => (None, None),
                    std::cmp::Ordering::Equal => (existing.ttl, existing.expires_at),
                    std::cmp::Ordering::Greater => ttl_fields(ttl_seconds),
                };
                w.insert(
                    key.to_string(),
                    Entry {
                        value: v,
                        ttl,
                        expires_at,
                    },
                );
                SetOutcome::Replaced
            }
        }
    }

    pub fn set_str(&self, key: &str, value: &str, ttl_seconds: i64, nx: bool) -> SetOutcome {
        self.set(key, Some(KvValue::from_str(value)), ttl_seconds, nx)
    }

    pub fn del(&self, key: &str) -> SetOutcome {
        self.set(key, None, 0, false)
    }

    /// Remove all expired entries across every shard. Run periodically by a
    /// background thread; also called directly in tests.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut w = shard.map.write();
            let expired_keys: Vec<String> = w
                .iter()
                .filter(|(_, e)| is_expired(e))
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired_keys {
                w.remove(&k);
                removed += 1;
            }
        }
        removed
    }

    /// Spawn the background sweep thread described in design note §9 (the
    /// portable stand-in for the source's real-time-signal timer). Returns a
    /// handle the caller can detach; the thread runs until the process exits.
    pub fn spawn_sweeper(&self, interval: Duration) -> std::thread::JoinHandle<()> {
        let this = self.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            this.sweep();
        })
    }
}

fn is_expired(entry: &Entry) -> bool {
    match entry.expires_at {
        Some(exp) => Instant::now() >= exp,
        None => false,
    }
}

fn ttl_fields(ttl_seconds: i64) -> (Option<Duration>, Option<Instant>) {
    if ttl_seconds > 0 {
        let ttl = Duration::from_secs(ttl_seconds as u64);
        (Some(ttl), Some(Instant::now() + ttl))
    } else {
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_delete_of_absent_key() {
        let kv = KvStore::new();
        assert_eq!(kv.set("missing", None, 0, false), SetOutcome::Rejected);
        assert!(kv.get("missing").is_none());
    }

    #[test]
    fn insert_then_get_roundtrip() {
        let kv = KvStore::new();
        assert_eq!(kv.set_str("n", "1", 0, false), SetOutcome::Inserted);
        assert_eq!(kv.get_str("n").as_deref(), Some("1"));
    }

    #[test]
    fn nx_rejects_second_write() {
        let kv = KvStore::new();
        assert_eq!(kv.set_str("n", "1", 0, false), SetOutcome::Inserted);
        assert_eq!(kv.set_str("n", "2", 0, true), SetOutcome::Rejected);
        assert_eq!(kv.get_str("n").as_deref(), Some("1"));
    }

    #[test]
    fn delete_removes_entry() {
        let kv = KvStore::new();
        kv.set_str("n", "1", 0, false);
        assert_eq!(kv.del("n"), SetOutcome::Deleted);
        assert!(kv.get("n").is_none());
    }

    #[test]
    fn negative_ttl_on_replace_clears_timer() {
        let kv = KvStore::new();
        kv.set_str("n", "1", 60, false);
        assert_eq!(kv.set_str("n", "2", -1, false), SetOutcome::Replaced);
        // Entry survives without an expiry now; sweeping must not remove it.
        kv.sweep();
        assert_eq!(kv.get_str("n").as_deref(), Some("2"));
    }

    #[test]
    fn ttl_expiry_makes_key_absent() {
        let kv = KvStore::new();
        kv.set_str("x", "v", 1, false);
        assert_eq!(kv.get_str("x").as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(kv.get_str("x").is_none());
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let kv = KvStore::new();
        for i in 0..5 {
            kv.set_str(&format!("k{i}"), "v", 1, false);
        }
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(kv.sweep(), 5);
    }

    #[test]
    fn zero_ttl_replace_leaves_existing_timer_untouched() {
        let kv = KvStore::new();
        kv.set_str("k", "1", 1, false);
        assert_eq!(kv.set_str("k", "2", 0, false), SetOutcome::Replaced);
        std::thread::sleep(Duration::from_millis(1100));
        assert!(kv.get_str("k").is_none());
    }

    #[test]
    fn native_free_fn_runs_exactly_once_on_delete() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn free(_p: *mut c_void) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }
        let kv = KvStore::new();
        kv.set(
            "native",
            Some(KvValue::Native {
                ptr: 0xdead_beef,
                free_fn: Some(free),
            }),
            0,
            false,
        );
        kv.del("native");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
