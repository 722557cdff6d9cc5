// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # cache
//!
//! The shared key-value cache behind the chunk store, key-chain & policy caches.
//!
//! The interface is the handful of operations the timeline subsystem actually needs: plain
//! get/set with a TTL, add-if-absent, prepend-if-present, set membership & prefix deletion.
//! [MemoryCache] serves single-node deployments & tests; [RedisCache] is the production
//! implementation.
//!
//! [RedisCache]: crate::redis_store::RedisCache

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

type StdResult<T, E> = std::result::Result<T, E>;

#[async_trait]
pub trait Cache {
    async fn get(&self, key: &str) -> StdResult<Option<String>, Error>;
    /// Look-up several keys at once; the result is parallel to `keys`
    async fn get_multi(&self, keys: &[String]) -> StdResult<Vec<Option<String>>, Error>;
    /// Unconditionally set `key`; no `ttl` means the entry never expires
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StdResult<(), Error>;
    /// Set `key` only if it's not already present; return true if the value was written
    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> StdResult<bool, Error>;
    /// Prepend `value` to the existing value at `key`, preserving its expiry; return false (and
    /// write nothing) if there is no existing value
    async fn prepend(&self, key: &str, value: &str) -> StdResult<bool, Error>;
    async fn delete(&self, key: &str) -> StdResult<(), Error>;
    /// Remove every key beginning with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> StdResult<(), Error>;
    /// Add `member` to the set at `key`, (re)setting the set's expiry
    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> StdResult<(), Error>;
    async fn smembers(&self, key: &str) -> StdResult<Vec<String>, Error>;
    async fn ping(&self) -> StdResult<(), Error>;
}

enum Value {
    Text(String),
    Set(HashSet<String>),
}

struct Entry {
    value: Value,
    expires: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires.is_none_or(|at| now < at)
    }
}

/// In-process [Cache]
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }
}

fn text_of(entries: &HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
    match entries.get(key) {
        Some(Entry {
            value: Value::Text(text),
            expires,
        }) if expires.is_none_or(|at| now < at) => Some(text.clone()),
        _ => None,
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> StdResult<Option<String>, Error> {
        let entries = self.entries.lock().await;
        Ok(text_of(&entries, key, Instant::now()))
    }

    async fn get_multi(&self, keys: &[String]) -> StdResult<Vec<Option<String>>, Error> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(keys.iter().map(|key| text_of(&entries, key, now)).collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StdResult<(), Error> {
        self.entries.lock().await.insert(
            key.to_owned(),
            Entry {
                value: Value::Text(value.to_owned()),
                expires: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> StdResult<bool, Error> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Text(value.to_owned()),
                expires: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn prepend(&self, key: &str, value: &str) -> StdResult<bool, Error> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => match &mut entry.value {
                Value::Text(text) => {
                    text.insert_str(0, value);
                    Ok(true)
                }
                Value::Set(_) => Ok(false),
            },
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StdResult<(), Error> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StdResult<(), Error> {
        self.entries
            .lock()
            .await
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> StdResult<(), Error> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expires = ttl.map(|ttl| now + ttl);
        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(members),
                expires: at,
            }) if at.is_none_or(|at| now < at) => {
                members.insert(member.to_owned());
                *at = expires;
            }
            _ => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: Value::Set(HashSet::from([member.to_owned()])),
                        expires,
                    },
                );
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StdResult<Vec<String>, Error> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry @ Entry {
                value: Value::Set(members),
                ..
            }) if entry.live(Instant::now()) => Ok(members.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> StdResult<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn prepend_requires_a_value() {
        let cache = MemoryCache::new();
        assert!(!cache.prepend("tl:body:x:0", "a,").await.unwrap());
        assert!(cache.get("tl:body:x:0").await.unwrap().is_none());
        assert!(cache.add("tl:body:x:0", "", None).await.unwrap());
        assert!(!cache.add("tl:body:x:0", "nope", None).await.unwrap());
        assert!(cache.prepend("tl:body:x:0", "a,").await.unwrap());
        assert!(cache.prepend("tl:body:x:0", "b,").await.unwrap());
        assert_eq!(
            cache.get("tl:body:x:0").await.unwrap().as_deref(),
            Some("b,a,")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        cache.sadd("s", "m1", Some(Duration::from_secs(60))).await.unwrap();
        cache.sadd("s", "m2", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(cache.smembers("s").await.unwrap().len(), 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.smembers("s").await.unwrap().is_empty());
        // an expired entry doesn't block an add
        assert!(cache.add("k", "w", None).await.unwrap());
    }

    #[tokio::test]
    async fn prefix_deletion() {
        let cache = MemoryCache::new();
        cache.set("tl:itr:a:0", "0", None).await.unwrap();
        cache.set("tl:body:a:0", "", None).await.unwrap();
        cache.set("keychain:x", "[]", None).await.unwrap();
        cache.delete_prefix("tl:").await.unwrap();
        assert_eq!(
            cache
                .get_multi(&[
                    "tl:itr:a:0".to_owned(),
                    "tl:body:a:0".to_owned(),
                    "keychain:x".to_owned()
                ])
                .await
                .unwrap(),
            vec![None, None, Some("[]".to_owned())]
        );
    }
}
