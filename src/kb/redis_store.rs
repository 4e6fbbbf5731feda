//! # Stage: Redis Document Driver
//!
//! ## Responsibility
//! Stores causes in a Redis hash (`bfa:causes`, id to JSON document) with
//! insertion order kept in a list (`bfa:cause-ids`).  Statistics go to a
//! Redis list (`bfa:statistics`), newest first.
//!
//! ## Guarantees
//! - All Redis access goes through [`RedisOps`], so tests run against an
//!   in-memory mock
//! - Non-panicking: every Redis error becomes a `StorageError`
//! - Record rewrites (update, tombstone, last-seen) are one optimistic
//!   `WATCH`/`MULTI` transaction, so a concurrent writer is never overwritten
//!   with a stale copy
//!
//! ## NOT Responsible For
//! - Server-side filtering: Redis has no query language for JSON values, so
//!   `StatisticsFilter` is evaluated in process

#![cfg(feature = "redis-backing")]

use std::sync::Mutex;

use super::document::{CauseQuery, DocumentDriver};
use crate::error::StorageError;
use crate::model::{FailureCause, Statistics, StatisticsFilter, Tombstone};

const BACKEND: &str = "redis";

// ---------------------------------------------------------------------------
// Redis key constants
// ---------------------------------------------------------------------------

const KEY_CAUSES: &str = "bfa:causes";
const KEY_CAUSE_IDS: &str = "bfa:cause-ids";
const KEY_STATISTICS: &str = "bfa:statistics";

// ---------------------------------------------------------------------------
// RedisOps trait
// ---------------------------------------------------------------------------

/// Abstraction over the Redis commands needed by [`RedisDriver`].
pub trait RedisOps: Send {
    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), String>;
    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, String>;
    fn hexists(&mut self, key: &str, field: &str) -> Result<bool, String>;
    /// Atomically rewrite one hash field.  `update` sees the current value and
    /// returns the replacement, or `None` to leave it alone.  Returns the value
    /// written.
    fn hupdate(
        &mut self,
        key: &str,
        field: &str,
        update: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<Option<String>, String>;
    fn rpush(&mut self, key: &str, value: &str) -> Result<(), String>;
    fn lpush(&mut self, key: &str, value: &str) -> Result<(), String>;
    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String>;
    fn ping(&mut self) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// redis::Connection impl
// ---------------------------------------------------------------------------

impl RedisOps for redis::Connection {
    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), String> {
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query::<()>(self)
            .map_err(|e| e.to_string())
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, String> {
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query::<Option<String>>(self)
            .map_err(|e| e.to_string())
    }

    fn hexists(&mut self, key: &str, field: &str) -> Result<bool, String> {
        redis::cmd("HEXISTS")
            .arg(key)
            .arg(field)
            .query::<bool>(self)
            .map_err(|e| e.to_string())
    }

    fn hupdate(
        &mut self,
        key: &str,
        field: &str,
        update: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<Option<String>, String> {
        // `transaction` re-runs the closure while EXEC is aborted by a WATCH hit.
        redis::transaction(self, &[key], |con, pipe| {
            let current: Option<String> = redis::cmd("HGET").arg(key).arg(field).query(con)?;
            let Some(next) = update(current.as_deref()) else {
                return Ok(Some(None));
            };
            let applied: Option<redis::Value> = pipe.cmd("HSET").arg(key).arg(field).arg(&next).query(con)?;
            Ok(applied.map(|_| Some(next)))
        })
        .map_err(|e| e.to_string())
    }

    fn rpush(&mut self, key: &str, value: &str) -> Result<(), String> {
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query::<()>(self)
            .map_err(|e| e.to_string())
    }

    fn lpush(&mut self, key: &str, value: &str) -> Result<(), String> {
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query::<()>(self)
            .map_err(|e| e.to_string())
    }

    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String> {
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query::<Vec<String>>(self)
            .map_err(|e| e.to_string())
    }

    fn ping(&mut self) -> Result<(), String> {
        redis::cmd("PING")
            .query::<String>(self)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// MockRedisOps
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Default)]
pub(crate) struct MockRedisOps {
    hashes: std::collections::HashMap<String, std::collections::HashMap<String, String>>,
    lists: std::collections::HashMap<String, Vec<String>>,
}

#[cfg(test)]
impl RedisOps for MockRedisOps {
    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), String> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, String> {
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    fn hexists(&mut self, key: &str, field: &str) -> Result<bool, String> {
        Ok(self.hashes.get(key).is_some_and(|h| h.contains_key(field)))
    }

    fn hupdate(
        &mut self,
        key: &str,
        field: &str,
        update: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<Option<String>, String> {
        let current = self.hget(key, field)?;
        let next = update(current.as_deref());
        if let Some(v) = &next {
            self.hset(key, field, v)?;
        }
        Ok(next)
    }

    fn rpush(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.lists.entry(key.to_string()).or_default().push(value.to_string());
        Ok(())
    }

    fn lpush(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.lists.entry(key.to_string()).or_default().insert(0, value.to_string());
        Ok(())
    }

    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String> {
        let list = self.lists.get(key).cloned().unwrap_or_default();
        let len = list.len() as isize;
        let s = if start < 0 { (len + start).max(0) } else { start };
        let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || s > e {
            return Ok(vec![]);
        }
        Ok(list[s as usize..=e as usize].to_vec())
    }

    fn ping(&mut self) -> Result<(), String> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RedisDriver
// ---------------------------------------------------------------------------

/// Redis-backed [`DocumentDriver`].
///
/// # Construction
/// - `connect(url)` opens a blocking Redis connection and pings it
/// - `with_ops(ops)` injects any `RedisOps` (used in tests)
pub struct RedisDriver {
    ops: Mutex<Box<dyn RedisOps>>,
}

impl RedisDriver {
    pub fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(|e| StorageError::connection(BACKEND, e))?;
        let mut conn = client
            .get_connection()
            .map_err(|e| StorageError::connection(BACKEND, e))?;
        RedisOps::ping(&mut conn).map_err(|e| StorageError::connection(BACKEND, e))?;
        Ok(Self::with_ops(Box::new(conn)))
    }

    pub fn with_ops(ops: Box<dyn RedisOps>) -> Self {
        Self { ops: Mutex::new(ops) }
    }

    fn locked<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn RedisOps) -> Result<T, String>,
    {
        let mut guard = self
            .ops
            .lock()
            .map_err(|_| StorageError::query(BACKEND, "connection lock poisoned"))?;
        f(guard.as_mut()).map_err(|e| StorageError::query(BACKEND, e))
    }

    /// Apply `edit` to the stored cause in one transaction.  `edit` returns
    /// `false` to skip the write.  Returns the cause as written.
    fn rewrite_cause<F>(&self, id: &str, mut edit: F) -> Result<Option<FailureCause>, StorageError>
    where
        F: FnMut(&mut FailureCause) -> bool,
    {
        let mut codec_err = None;
        let mut written = None;
        let doc = self.locked(|ops| {
            ops.hupdate(KEY_CAUSES, id, &mut |current: Option<&str>| {
                written = None;
                let mut cause: FailureCause = match serde_json::from_str(current?) {
                    Ok(c) => c,
                    Err(e) => {
                        codec_err = Some(e);
                        return None;
                    }
                };
                if !edit(&mut cause) {
                    return None;
                }
                match serde_json::to_string(&cause) {
                    Ok(doc) => {
                        written = Some(cause);
                        Some(doc)
                    }
                    Err(e) => {
                        codec_err = Some(e);
                        None
                    }
                }
            })
        })?;
        if let Some(e) = codec_err {
            return Err(e.into());
        }
        Ok(doc.and(written))
    }
}

impl DocumentDriver for RedisDriver {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn get(&self, id: &str) -> Result<Option<FailureCause>, StorageError> {
        let doc = self.locked(|ops| ops.hget(KEY_CAUSES, id))?;
        match doc {
            Some(d) => Ok(Some(serde_json::from_str(&d)?)),
            None => Ok(None),
        }
    }

    fn find(&self, query: &CauseQuery) -> Result<Vec<FailureCause>, StorageError> {
        let docs = self.locked(|ops| {
            let ids = ops.lrange(KEY_CAUSE_IDS, 0, -1)?;
            let mut docs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(doc) = ops.hget(KEY_CAUSES, &id)? {
                    docs.push(doc);
                }
            }
            Ok(docs)
        })?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let cause: FailureCause = serde_json::from_str(&doc)?;
            if query.matches(&cause) {
                out.push(cause);
            }
        }
        Ok(out)
    }

    fn insert(&self, cause: &FailureCause) -> Result<(), StorageError> {
        let doc = serde_json::to_string(cause)?;
        self.locked(|ops| {
            if ops.hexists(KEY_CAUSES, &cause.id)? {
                return Err(format!("duplicate failure cause id {}", cause.id));
            }
            ops.hset(KEY_CAUSES, &cause.id, &doc)?;
            ops.rpush(KEY_CAUSE_IDS, &cause.id)
        })
    }

    fn update(&self, cause: &FailureCause) -> Result<bool, StorageError> {
        let doc = serde_json::to_string(cause)?;
        let written = self.locked(|ops| {
            ops.hupdate(KEY_CAUSES, &cause.id, &mut |current: Option<&str>| current.map(|_| doc.clone()))
        })?;
        Ok(written.is_some())
    }

    fn tombstone(&self, id: &str, tombstone: &Tombstone) -> Result<Option<FailureCause>, StorageError> {
        self.rewrite_cause(id, |cause| {
            cause.removed = Some(tombstone.clone());
            true
        })
    }

    fn touch_last_occurred(&self, id: &str, time: u64) -> Result<bool, StorageError> {
        Ok(self.rewrite_cause(id, |cause| cause.touch_last_occurred(time))?.is_some())
    }

    fn append_statistics(&self, stat: &Statistics) -> Result<(), StorageError> {
        let doc = serde_json::to_string(stat)?;
        self.locked(|ops| ops.lpush(KEY_STATISTICS, &doc))
    }

    fn find_statistics(&self, filter: &StatisticsFilter, limit: Option<usize>) -> Result<Vec<Statistics>, StorageError> {
        let docs = self.locked(|ops| ops.lrange(KEY_STATISTICS, 0, -1))?;
        let mut out = Vec::new();
        for doc in docs {
            let stat: Statistics = serde_json::from_str(&doc)?;
            if filter.matches(&stat) {
                out.push(stat);
            }
        }
        out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if let Some(n) = limit {
            out.truncate(n);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
