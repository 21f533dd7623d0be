//! In-process store with Redis semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Command, RateLimitStore, Reply, StoreError};
use crate::clock::{Clock, SystemClock};

/// A value stored under a key.
#[derive(Debug, Clone)]
enum Value {
    String(String),
    SortedSet(BTreeMap<String, i64>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Expiry in epoch milliseconds
    expires_at: Option<i64>,
}

/// A store that keeps everything in process memory.
///
/// Each batch runs under one lock, which gives the same atomicity a Redis
/// `MULTI`/`EXEC` block gives. Expiry is evaluated lazily against the
/// injected clock, so tests driving a [`ManualClock`](crate::clock::ManualClock)
/// see keys expire in virtual time.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create a store that expires keys by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires keys by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .values()
            .filter(|e| !is_expired(e, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.lock().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn is_expired(entry: &Entry, now: i64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

/// Drop `key` if its expiry has passed.
fn purge(entries: &mut HashMap<String, Entry>, key: &str, now: i64) {
    if entries.get(key).is_some_and(|e| is_expired(e, now)) {
        entries.remove(key);
    }
}

fn apply(
    entries: &mut HashMap<String, Entry>,
    command: Command,
    now: i64,
) -> Result<Reply, StoreError> {
    match command {
        Command::Increment { key } => {
            purge(entries, &key, now);
            let entry = entries.entry(key.clone()).or_insert(Entry {
                value: Value::String("0".to_string()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::String(s) => {
                    let current: i64 = s.parse().map_err(|_| StoreError::UnexpectedReply {
                        command: "INCR",
                        reply: "value is not an integer".to_string(),
                    })?;
                    let next = current + 1;
                    *s = next.to_string();
                    Ok(Reply::Integer(next))
                }
                _ => Err(StoreError::WrongType(key)),
            }
        }
        Command::Expire { key, seconds } => {
            purge(entries, &key, now);
            if seconds == 0 {
                return Ok(Reply::Integer(entries.remove(&key).map_or(0, |_| 1)));
            }
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.expires_at = Some(expiry_at(now, seconds));
                    Ok(Reply::Integer(1))
                }
                None => Ok(Reply::Integer(0)),
            }
        }
        Command::Get { key } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Value(None)),
                Some(Value::String(s)) => Ok(Reply::Value(Some(s.clone()))),
                Some(_) => Err(StoreError::WrongType(key)),
            }
        }
        Command::SortedSetRemoveRangeByScore { key, min, max } => {
            purge(entries, &key, now);
            let Some(entry) = entries.get_mut(&key) else {
                return Ok(Reply::Integer(0));
            };
            let Value::SortedSet(set) = &mut entry.value else {
                return Err(StoreError::WrongType(key));
            };
            let before = set.len();
            set.retain(|_, score| *score < min || *score > max);
            let removed = before - set.len();
            if set.is_empty() {
                entries.remove(&key);
            }
            Ok(Reply::Integer(removed as i64))
        }
        Command::SortedSetAdd { key, score, member } => {
            purge(entries, &key, now);
            let entry = entries.entry(key.clone()).or_insert(Entry {
                value: Value::SortedSet(BTreeMap::new()),
                expires_at: None,
            });
            let Value::SortedSet(set) = &mut entry.value else {
                return Err(StoreError::WrongType(key));
            };
            let added = set.insert(member, score).is_none();
            Ok(Reply::Integer(added as i64))
        }
        Command::SortedSetCardinality { key } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Integer(0)),
                Some(Value::SortedSet(set)) => Ok(Reply::Integer(set.len() as i64)),
                Some(_) => Err(StoreError::WrongType(key)),
            }
        }
        Command::SortedSetCount { key, min, max } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Integer(0)),
                Some(Value::SortedSet(set)) => {
                    let count = set.values().filter(|s| **s >= min && **s <= max).count();
                    Ok(Reply::Integer(count as i64))
                }
                Some(_) => Err(StoreError::WrongType(key)),
            }
        }
        Command::HashGetMulti { key, fields } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Values(vec![None; fields.len()])),
                Some(Value::Hash(hash)) => Ok(Reply::Values(
                    fields.iter().map(|f| hash.get(f).cloned()).collect(),
                )),
                Some(_) => Err(StoreError::WrongType(key)),
            }
        }
        Command::HashSetMulti { key, pairs } => {
            purge(entries, &key, now);
            let entry = entries.entry(key.clone()).or_insert(Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            let Value::Hash(hash) = &mut entry.value else {
                return Err(StoreError::WrongType(key));
            };
            hash.extend(pairs);
            Ok(Reply::Ok)
        }
        Command::Delete { keys } => {
            let mut removed = 0;
            for key in keys {
                purge(entries, &key, now);
                if entries.remove(&key).is_some() {
                    removed += 1;
                }
            }
            Ok(Reply::Integer(removed))
        }
        Command::KeysMatching { pattern } => {
            let mut keys: Vec<String> = entries
                .iter()
                .filter(|(k, e)| !is_expired(e, now) && glob_match(&pattern, k))
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            Ok(Reply::Keys(keys))
        }
        Command::Ttl { key } => {
            purge(entries, &key, now);
            let ttl = match entries.get(&key) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => (at - now).saturating_add(999) / 1000,
            };
            Ok(Reply::Integer(ttl))
        }
    }
}

/// Deadline `seconds` after `now`, clamped at the far end of time.
fn expiry_at(now: i64, seconds: u64) -> i64 {
    let ms = i64::try_from(seconds).unwrap_or(i64::MAX).saturating_mul(1000);
    now.saturating_add(ms)
}

/// Redis `KEYS`-style glob matching with `*`, `?` and `\` escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() && p[pi + 1] == t[ti] => {
                    pi += 2;
                    ti += 1;
                    continue;
                }
                c if c != '\\' && c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        commands
            .into_iter()
            .map(|command| apply(&mut entries, command, now))
            .collect()
    }

    async fn compare_and_set_hash(
        &self,
        key: &str,
        expected: &[(String, String)],
        new: &[(String, String)],
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);

        let current = match entries.get(key).map(|e| &e.value) {
            None => None,
            Some(Value::Hash(hash)) => Some(hash),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        let unchanged = expected.iter().all(|(field, value)| {
            let held = current.and_then(|h| h.get(field)).map_or("", String::as_str);
            held == value
        });
        if !unchanged {
            return Ok(false);
        }

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Value::Hash(hash) = &mut entry.value {
            hash.extend(new.iter().cloned());
        }
        entry.expires_at = Some(expiry_at(now, ttl_secs));
        Ok(true)
    }

    async fn memory_usage(&self) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        Ok(Some(format!("{} keys", self.len())))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
