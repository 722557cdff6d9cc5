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

//! Redis implementations of the [Cache] & [Bus] traits

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::{
    cache::{Cache, Error as CacheError},
    pubsub::{Bus, Subscription},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to redis at {url}: {source}"))]
    Connect {
        url: String,
        source: redis::RedisError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

impl std::convert::From<redis::RedisError> for CacheError {
    fn from(value: redis::RedisError) -> Self {
        CacheError::new(value)
    }
}

// Prepend ARGV[1] to the value at KEYS[1] iff it exists, keeping its TTL
const PREPEND: &str = r"
local v = redis.call('GET', KEYS[1])
if not v then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1] .. v, 'KEEPTTL')
return 1
";

/// Keys are scanned in batches of this size when deleting by prefix
const SCAN_COUNT: usize = 500;

async fn connect(url: &str) -> Result<(Client, ConnectionManager)> {
    let client = Client::open(url).context(ConnectSnafu {
        url: url.to_owned(),
    })?;
    let conn = ConnectionManager::new(client.clone())
        .await
        .context(ConnectSnafu {
            url: url.to_owned(),
        })?;
    Ok((client, conn))
}

pub struct RedisCache {
    conn: ConnectionManager,
    prepend: Script,
}

impl RedisCache {
    pub async fn new(url: &str) -> Result<RedisCache> {
        let (_, conn) = connect(url).await?;
        Ok(RedisCache {
            conn,
            prepend: Script::new(PREPEND),
        })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> StdResult<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn get_multi(&self, keys: &[String]) -> StdResult<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StdResult<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StdResult<bool, CacheError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        // Redis replies "OK" on success & nil if the key was already there
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn prepend(&self, key: &str, value: &str) -> StdResult<bool, CacheError> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .prepend
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(written != 0)
    }

    async fn delete(&self, key: &str) -> StdResult<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StdResult<(), CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let _: () = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    async fn sadd(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> StdResult<(), CacheError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().sadd(key, member).ignore();
        if let Some(ttl) = ttl {
            pipe.expire(key, ttl.as_secs().max(1) as i64).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StdResult<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn ping(&self) -> StdResult<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Redis pub/sub as a [Bus]
///
/// Publishing goes over the shared, multiplexed connection; each subscription gets a dedicated
/// pub/sub connection of its own.
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn new(url: &str) -> Result<RedisBus> {
        let (client, conn) = connect(url).await?;
        Ok(RedisBus { client, conn })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> StdResult<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> StdResult<Subscription, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        if !channels.is_empty() {
            pubsub.subscribe(channels).await?;
        }
        Ok(Box::pin(pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            Some((msg.get_channel_name().to_owned(), payload))
        })))
    }
}
