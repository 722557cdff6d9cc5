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

//! # chunk store
//!
//! Timeline items live durably in [storage](crate::storage), but reads are served in ten-minute
//! *chunks* from the shared [Cache]. For a timeline `tl` & an [Epoch] `E` the cache holds:
//!
//! - `tl:itr:<tl>:<E>`: the *iterator*, the newest epoch at or before `E` in which `tl` has any
//!   items (or the sentinel `none`, briefly, if there is no such epoch)
//! - `tl:body:<tl>:<E>`: the chunk *body*, the items created during `E`, newest first, each
//!   serialized as JSON & followed by a comma
//!
//! The comma-terminated body format lets the write path add an item to a cached chunk with a
//! single prepend.
//!
//! Timelines are named here by their fully-qualified ids (`t<cdid>@<fqdn>`). Local timelines miss
//! to the database, remote ones to the [Peers] hosting them.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use itertools::Itertools;
use opentelemetry::KeyValue;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use concurrent_shared::{
    entities::{split_qualified, Chunk, TimelineItem},
    epoch::Epoch,
};

use crate::{
    cache::Cache,
    counter_add,
    metrics::{self, Instruments, Sort},
    peer::Peers,
    storage::{self, Backend as StorageBackend},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{resource} is already in timeline {timeline}"))]
    AlreadyExists {
        timeline: String,
        resource: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{timeline} does not name a timeline on this node"))]
    NotLocal {
        timeline: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        cache layout                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Iterators & bodies are retained for two days
pub const CHUNK_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);
/// "No such chunk" is remembered only briefly
const SENTINEL_TTL: Duration = Duration::from_secs(60);
const SENTINEL: &str = "none";
/// Recently removed items are remembered for two days
pub const REMOVED_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);
/// Remote retraction lists are re-fetched after a minute
const RETRACTED_TTL: Duration = Duration::from_secs(60);
/// Rebuilding a body from the database yields at most this many items
pub const MAX_BODY_ITEMS: usize = 100;

pub fn itr_key(timeline: &str, epoch: Epoch) -> String {
    format!("tl:itr:{timeline}:{epoch}")
}

pub fn body_key(timeline: &str, epoch: Epoch) -> String {
    format!("tl:body:{timeline}:{epoch}")
}

fn removed_key(dbid: &str) -> String {
    format!("timeline:{dbid}:deleted")
}

fn retracted_key(timeline: &str) -> String {
    format!("tl:retracted:{timeline}")
}

/// Serialize `items` in the comma-terminated body format
pub fn encode_body(items: &[TimelineItem]) -> String {
    items
        .iter()
        .filter_map(|item| match serde_json::to_string(item) {
            Ok(json) => Some(json + ","),
            Err(err) => {
                error!("Failed to serialize {}: {err}", item.resource_id);
                None
            }
        })
        .collect()
}

/// Parse a comma-terminated body; None if it's corrupt
pub fn decode_body(text: &str) -> Option<Vec<TimelineItem>> {
    let trimmed = text.trim().strip_suffix(',').unwrap_or(text.trim());
    match serde_json::from_str(&format!("[{trimmed}]")) {
        Ok(items) => Some(items),
        Err(err) => {
            warn!("Discarding a corrupt chunk body: {err}");
            None
        }
    }
}

inventory::submit! { metrics::Registration::new("chunk.itr.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("chunk.itr.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("chunk.body.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("chunk.body.misses", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ChunkStore                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct ChunkStore {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    cache: Arc<dyn Cache + Send + Sync>,
    peers: Arc<Peers>,
    fqdn: String,
    /// The remote timelines to which we hold a realtime subscription
    remote_subs: watch::Receiver<HashSet<String>>,
    instruments: Arc<Instruments>,
}

/// Set `tl:itr` & prepend to `tl:body` for a freshly-created (fully-qualified) item; if the body's
/// not cached, rebuild it from the database
async fn warm_chunk(
    storage: Arc<dyn StorageBackend + Send + Sync>,
    cache: Arc<dyn Cache + Send + Sync>,
    fqdn: String,
    dbid: String,
    item: TimelineItem,
) {
    let epoch = item.epoch();
    let timeline = item.timeline_id.clone();
    if let Err(err) = cache
        .set(&itr_key(&timeline, epoch), &epoch.to_string(), Some(CHUNK_TTL))
        .await
    {
        warn!("Failed to set the iterator for {timeline}@{epoch}: {err}");
        return;
    }
    match cache
        .prepend(&body_key(&timeline, epoch), &encode_body(&[item]))
        .await
    {
        Ok(true) => (),
        Ok(false) => {
            match storage
                .items_in_range(&dbid, &epoch.start(), &epoch.end(), MAX_BODY_ITEMS)
                .await
            {
                Ok(items) => {
                    let items = items
                        .into_iter()
                        .map(|item| qualify_item(&fqdn, item))
                        .collect::<Vec<_>>();
                    if let Err(err) = cache
                        .set(&body_key(&timeline, epoch), &encode_body(&items), Some(CHUNK_TTL))
                        .await
                    {
                        warn!("Failed to rebuild the body for {timeline}@{epoch}: {err}");
                    }
                }
                Err(err) => warn!("Failed to read {timeline}@{epoch} back: {err}"),
            }
        }
        Err(err) => warn!("Failed to prepend to {timeline}@{epoch}: {err}"),
    }
}

fn qualify_item(fqdn: &str, mut item: TimelineItem) -> TimelineItem {
    item.timeline_id = format!("t{}@{fqdn}", item.timeline_id);
    item
}

impl ChunkStore {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        cache: Arc<dyn Cache + Send + Sync>,
        peers: Arc<Peers>,
        fqdn: &str,
        remote_subs: watch::Receiver<HashSet<String>>,
        instruments: Arc<Instruments>,
    ) -> ChunkStore {
        ChunkStore {
            storage,
            cache,
            peers,
            fqdn: fqdn.to_owned(),
            remote_subs,
            instruments,
        }
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// The database id (the bare CDID) of `timeline`, provided it's one of ours
    ///
    /// Accepts `<cdid>`, `t<cdid>` & either qualified with our domain.
    pub fn local_dbid(&self, timeline: &str) -> Option<String> {
        let (id, domain) = split_qualified(timeline);
        if domain.is_some_and(|domain| domain != self.fqdn) {
            return None;
        }
        let id = match id.len() {
            27 => id.strip_prefix('t')?,
            26 => id,
            _ => return None,
        };
        Some(id.to_owned())
    }

    /// `t<cdid>@<fqdn>` for one of our timelines
    pub fn qualify(&self, dbid: &str) -> String {
        format!("t{dbid}@{}", self.fqdn)
    }

    fn is_local(&self, timeline: &str) -> bool {
        split_qualified(timeline).1 == Some(self.fqdn.as_str())
    }

    /// Group fully-qualified `timelines` by hosting domain; unqualified references are dropped
    fn by_domain<'a, I>(timelines: I) -> HashMap<String, Vec<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        timelines
            .into_iter()
            .filter_map(|timeline| {
                split_qualified(timeline)
                    .1
                    .map(|domain| (domain.to_owned(), timeline.clone()))
            })
            .into_group_map()
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // items
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Persist `item` in one of our timelines; the cache is updated in the background
    ///
    /// `item.timeline_id` may be given in any form [local_dbid](Self::local_dbid) accepts; the
    /// returned item is fully-qualified.
    #[instrument(skip(self, item), fields(resource = %item.resource_id))]
    pub async fn create_item(&self, mut item: TimelineItem) -> Result<TimelineItem> {
        let timeline = item.timeline_id.clone();
        let dbid = self
            .local_dbid(&timeline)
            .ok_or_else(|| NotLocalSnafu { timeline: timeline.clone() }.build())?;
        item.timeline_id = dbid.clone();
        if !self.storage.create_item(&item).await.context(StorageSnafu)? {
            return AlreadyExistsSnafu {
                timeline,
                resource: item.resource_id,
            }
            .fail();
        }
        let item = qualify_item(&self.fqdn, item);
        tokio::spawn(warm_chunk(
            self.storage.clone(),
            self.cache.clone(),
            self.fqdn.clone(),
            dbid,
            item.clone(),
        ));
        Ok(item)
    }

    pub async fn get_item(&self, timeline: &str, resource: &str) -> Result<Option<TimelineItem>> {
        let dbid = self
            .local_dbid(timeline)
            .ok_or_else(|| NotLocalSnafu { timeline }.build())?;
        Ok(self
            .storage
            .get_item(&dbid, resource)
            .await
            .context(StorageSnafu)?
            .map(|item| qualify_item(&self.fqdn, item)))
    }

    /// Remove an item from one of our timelines, remembering it as recently removed so that
    /// cached chunks still holding it can be filtered
    #[instrument(skip(self))]
    pub async fn delete_item(&self, timeline: &str, resource: &str) -> Result<bool> {
        let dbid = self
            .local_dbid(timeline)
            .ok_or_else(|| NotLocalSnafu { timeline }.build())?;
        if let Err(err) = self
            .cache
            .sadd(&removed_key(&dbid), resource, Some(REMOVED_TTL))
            .await
        {
            warn!("Failed to record the removal of {resource} from {timeline}: {err}");
        }
        self.storage
            .delete_item(&dbid, resource)
            .await
            .context(StorageSnafu)
    }

    /// Drop every cached iterator & body for `timeline`
    pub async fn forget_timeline(&self, timeline: &str) {
        for prefix in [
            format!("tl:itr:{timeline}:"),
            format!("tl:body:{timeline}:"),
        ] {
            if let Err(err) = self.cache.delete_prefix(&prefix).await {
                warn!("Failed to clear {prefix}*: {err}");
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // chunks
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// For each of `timelines`, the newest epoch at or before `epoch` holding any of its items
    ///
    /// Timelines with no such epoch (or that couldn't be reached) are absent from the result.
    #[instrument(skip(self, timelines), fields(n = timelines.len()))]
    pub async fn lookup_chunk_itrs(
        &self,
        timelines: &[String],
        epoch: Epoch,
    ) -> HashMap<String, Epoch> {
        let keys = timelines
            .iter()
            .map(|timeline| itr_key(timeline, epoch))
            .collect::<Vec<_>>();
        let cached = self.cache.get_multi(&keys).await.unwrap_or_else(|err| {
            warn!("Failed to look up chunk iterators: {err}");
            vec![None; keys.len()]
        });

        let mut result = HashMap::new();
        let mut missed = Vec::new();
        for (timeline, value) in timelines.iter().zip(cached) {
            match value.as_deref() {
                Some(SENTINEL) => {
                    counter_add!(self.instruments, "chunk.itr.hits", 1, &[]);
                }
                Some(text) => match text.parse::<Epoch>() {
                    Ok(itr) => {
                        counter_add!(self.instruments, "chunk.itr.hits", 1, &[]);
                        result.insert(timeline.clone(), itr);
                    }
                    Err(_) => missed.push(timeline.clone()),
                },
                None => missed.push(timeline.clone()),
            }
        }
        if missed.is_empty() {
            return result;
        }
        counter_add!(
            self.instruments,
            "chunk.itr.misses",
            missed.len() as u64,
            &[]
        );

        for (domain, timelines) in Self::by_domain(&missed) {
            if domain == self.fqdn {
                result.extend(self.lookup_local_itrs(&timelines, epoch).await);
            } else {
                result.extend(
                    self.fetch_remote(&domain, &timelines, epoch)
                        .await
                        .into_iter()
                        .map(|(timeline, chunk)| (timeline, chunk.epoch)),
                );
            }
        }
        result
    }

    async fn lookup_local_itrs(&self, timelines: &[String], epoch: Epoch) -> HashMap<String, Epoch> {
        let dbids = timelines
            .iter()
            .filter_map(|timeline| self.local_dbid(timeline))
            .collect::<Vec<_>>();
        let latest = match self
            .storage
            .latest_item_times(&dbids, &epoch.end())
            .await
        {
            Ok(latest) => latest,
            Err(err) => {
                error!("Failed to look up local chunk iterators: {err}");
                return HashMap::new();
            }
        };
        let mut result = HashMap::new();
        for dbid in dbids {
            let timeline = self.qualify(&dbid);
            let key = itr_key(&timeline, epoch);
            let outcome = match latest.get(&dbid) {
                Some(t) => {
                    let itr = Epoch::of(t);
                    result.insert(timeline.clone(), itr);
                    self.cache.set(&key, &itr.to_string(), Some(CHUNK_TTL)).await
                }
                None => self.cache.set(&key, SENTINEL, Some(SENTINEL_TTL)).await,
            };
            if let Err(err) = outcome {
                warn!("Failed to memoise {key}: {err}");
            }
        }
        result
    }

    /// Load the chunk body for each `(timeline, epoch)` in `query`
    ///
    /// Timelines whose body can't be had are absent from the result.
    #[instrument(skip(self, query), fields(n = query.len()))]
    pub async fn load_chunk_bodies(
        &self,
        query: &HashMap<String, Epoch>,
    ) -> HashMap<String, Chunk> {
        let (timelines, keys): (Vec<&String>, Vec<String>) = query
            .iter()
            .map(|(timeline, epoch)| (timeline, body_key(timeline, *epoch)))
            .unzip();
        let cached = self.cache.get_multi(&keys).await.unwrap_or_else(|err| {
            warn!("Failed to look up chunk bodies: {err}");
            vec![None; keys.len()]
        });

        let mut result = HashMap::new();
        let mut missed = Vec::new();
        for ((timeline, key), value) in timelines.into_iter().zip(keys).zip(cached) {
            let epoch = query[timeline];
            match value.as_deref().and_then(decode_body) {
                Some(items) => {
                    counter_add!(self.instruments, "chunk.body.hits", 1, &[]);
                    result.insert(timeline.clone(), Chunk { key, epoch, items });
                }
                None => missed.push(timeline.clone()),
            }
        }
        if missed.is_empty() {
            return result;
        }
        counter_add!(
            self.instruments,
            "chunk.body.misses",
            missed.len() as u64,
            &[]
        );

        for (domain, timelines) in Self::by_domain(&missed) {
            if domain == self.fqdn {
                for timeline in timelines {
                    let epoch = query[&timeline];
                    if let Some(chunk) = self.load_local_body(&timeline, epoch).await {
                        result.insert(timeline, chunk);
                    }
                }
            } else {
                // Peers answer a chunk request with the chunk enclosing or preceding the
                // requested time; ask per distinct epoch
                let by_epoch = timelines
                    .into_iter()
                    .map(|timeline| (query[&timeline], timeline))
                    .into_group_map();
                for (epoch, timelines) in by_epoch {
                    result.extend(self.fetch_remote(&domain, &timelines, epoch).await);
                }
            }
        }
        result
    }

    async fn load_local_body(&self, timeline: &str, epoch: Epoch) -> Option<Chunk> {
        let dbid = self.local_dbid(timeline)?;
        let items = match self
            .storage
            .items_in_range(&dbid, &epoch.start(), &epoch.end(), MAX_BODY_ITEMS)
            .await
        {
            Ok(items) => items,
            Err(err) => {
                error!("Failed to load {timeline}@{epoch}: {err}");
                return None;
            }
        };
        let items = items
            .into_iter()
            .map(|item| qualify_item(&self.fqdn, item))
            .collect::<Vec<_>>();
        let key = body_key(timeline, epoch);
        if let Err(err) = self
            .cache
            .set(&key, &encode_body(&items), Some(CHUNK_TTL))
            .await
        {
            warn!("Failed to cache {key}: {err}");
        }
        Some(Chunk { key, epoch, items })
    }

    /// Fetch the chunks enclosing or preceding `epoch` for `timelines`, all hosted by `domain`
    ///
    /// A chunk is cached when it can no longer change without our hearing about it: when it
    /// precedes the current epoch, or when we hold a realtime subscription to its timeline.
    pub async fn fetch_remote(
        &self,
        domain: &str,
        timelines: &[String],
        epoch: Epoch,
    ) -> HashMap<String, Chunk> {
        if let Err(err) = self.peers.ensure_same_dimension(domain).await {
            warn!("Not fetching chunks from {domain}: {err}");
            return HashMap::new();
        }
        let chunks = match self.peers.get_chunks(domain, timelines, epoch).await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!("Failed to fetch chunks from {domain}: {err}");
                return HashMap::new();
            }
        };
        let current = Epoch::current();
        let subscribed = self.remote_subs.borrow().clone();
        for (timeline, chunk) in &chunks {
            let watched = subscribed.contains(timeline);
            if epoch < current || watched {
                if let Err(err) = self
                    .cache
                    .set(
                        &itr_key(timeline, epoch),
                        &chunk.epoch.to_string(),
                        Some(CHUNK_TTL),
                    )
                    .await
                {
                    warn!("Failed to cache the iterator for {timeline}: {err}");
                }
            }
            if chunk.epoch < current || watched {
                if let Err(err) = self
                    .cache
                    .set(
                        &body_key(timeline, chunk.epoch),
                        &encode_body(&chunk.items),
                        Some(CHUNK_TTL),
                    )
                    .await
                {
                    warn!("Failed to cache the body for {timeline}: {err}");
                }
            }
        }
        debug!("Fetched {} chunks from {domain}", chunks.len());
        chunks
    }

    /// Seed the chunk `to` for each of `timelines` from the chunk `from`: copy the iterator &
    /// lay down an empty body, in each case only if nothing's there yet
    ///
    /// Called at epoch boundaries for remote timelines we're subscribed to, so that realtime
    /// events arriving in the new epoch land in a cached body.
    pub async fn roll_epoch(&self, timelines: &[String], from: Epoch, to: Epoch) {
        for timeline in timelines {
            match self.cache.get(&itr_key(timeline, from)).await {
                Ok(Some(itr)) if itr != SENTINEL => {
                    if let Err(err) = self
                        .cache
                        .add(&itr_key(timeline, to), &itr, Some(CHUNK_TTL))
                        .await
                    {
                        warn!("Failed to roll the iterator for {timeline}: {err}");
                    }
                }
                Ok(_) => (),
                Err(err) => warn!("Failed to read the iterator for {timeline}: {err}"),
            }
            if let Err(err) = self
                .cache
                .add(&body_key(timeline, to), "", Some(CHUNK_TTL))
                .await
            {
                warn!("Failed to seed the body for {timeline}: {err}");
            }
        }
    }

    /// Record an item relayed from a peer in the cached chunk for its epoch; a body that isn't
    /// cached is left alone
    pub async fn absorb_remote_item(&self, item: &TimelineItem) {
        let epoch = item.epoch();
        let timeline = &item.timeline_id;
        if let Err(err) = self
            .cache
            .set(&itr_key(timeline, epoch), &epoch.to_string(), Some(CHUNK_TTL))
            .await
        {
            warn!("Failed to advance the iterator for {timeline}: {err}");
        }
        match self
            .cache
            .prepend(&body_key(timeline, epoch), &encode_body(std::slice::from_ref(item)))
            .await
        {
            Ok(true) => (),
            Ok(false) => debug!("No cached body for {timeline}@{epoch}"),
            Err(err) => warn!("Failed to prepend to {timeline}@{epoch}: {err}"),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // removals
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// The ids of resources recently removed from each of `timelines`
    #[instrument(skip(self, timelines), fields(n = timelines.len()))]
    pub async fn list_recently_removed_items(
        &self,
        timelines: &[String],
    ) -> HashMap<String, Vec<String>> {
        let mut result = HashMap::new();
        for (domain, timelines) in Self::by_domain(timelines) {
            if domain == self.fqdn {
                for timeline in timelines {
                    let Some(dbid) = self.local_dbid(&timeline) else {
                        continue;
                    };
                    match self.cache.smembers(&removed_key(&dbid)).await {
                        Ok(removed) => {
                            result.insert(timeline, removed);
                        }
                        Err(err) => warn!("Failed to list removals from {timeline}: {err}"),
                    }
                }
            } else {
                result.extend(self.remote_removals(&domain, &timelines).await);
            }
        }
        result
    }

    async fn remote_removals(
        &self,
        domain: &str,
        timelines: &[String],
    ) -> HashMap<String, Vec<String>> {
        let keys = timelines.iter().map(|tl| retracted_key(tl)).collect::<Vec<_>>();
        let cached = self
            .cache
            .get_multi(&keys)
            .await
            .unwrap_or_else(|_| vec![None; keys.len()]);
        let mut result = HashMap::new();
        let mut missed = Vec::new();
        for (timeline, value) in timelines.iter().zip(cached) {
            match value.map(|text| serde_json::from_str::<Vec<String>>(&text)) {
                Some(Ok(removed)) => {
                    result.insert(timeline.clone(), removed);
                }
                _ => missed.push(timeline.clone()),
            }
        }
        if missed.is_empty() {
            return result;
        }
        match self.peers.get_retracted(domain, &missed).await {
            Ok(fetched) => {
                for (timeline, removed) in fetched {
                    if !missed.contains(&timeline) {
                        continue;
                    }
                    match serde_json::to_string(&removed) {
                        Ok(text) => {
                            if let Err(err) = self
                                .cache
                                .set(&retracted_key(&timeline), &text, Some(RETRACTED_TTL))
                                .await
                            {
                                warn!("Failed to cache removals for {timeline}: {err}");
                            }
                        }
                        Err(err) => warn!("{err}"),
                    }
                    result.insert(timeline, removed);
                }
            }
            Err(err) => warn!("Failed to fetch removals from {domain}: {err}"),
        }
        result
    }

    /// Items in our own `timelines` created strictly after `since`, oldest first
    pub async fn local_items_after(
        &self,
        timelines: &[String],
        since: &chrono::DateTime<chrono::Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let dbids = timelines
            .iter()
            .filter(|timeline| self.is_local(timeline))
            .filter_map(|timeline| self.local_dbid(timeline))
            .collect::<Vec<_>>();
        Ok(self
            .storage
            .items_after(&dbids, since, limit)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(|item| qualify_item(&self.fqdn, item))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use url::Url;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{cache::MemoryCache, client::make_client, memory::MemoryBackend};

    const TL: &str = "0123456789abcdefghjkmnpqrs";

    struct Fixture {
        store: ChunkStore,
        cache: Arc<MemoryCache>,
        subs: watch::Sender<HashSet<String>>,
    }

    fn fixture(origins: HashMap<String, Url>) -> Fixture {
        let instruments = Arc::new(Instruments::new("concurrent-test"));
        let storage = Arc::new(MemoryBackend::new());
        let cache = Arc::new(MemoryCache::new());
        let client = make_client("concurrent unit tests", instruments.clone()).unwrap();
        let peers = Arc::new(Peers::new(client, storage.clone(), "cc-test", origins));
        let (subs, rx) = watch::channel(HashSet::new());
        Fixture {
            store: ChunkStore::new(storage, cache.clone(), peers, "ours.example", rx, instruments),
            cache,
            subs,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn item(resource: &str, timeline: &str, secs: i64) -> TimelineItem {
        TimelineItem {
            resource_id: resource.to_owned(),
            timeline_id: timeline.to_owned(),
            owner: "con1owner".to_owned(),
            author: None,
            schema: None,
            cdate: at(secs),
        }
    }

    // Let the background cache writes land
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn body_format() {
        let items = vec![
            item("m2", "tA@x", 1_700_000_001),
            item("m1", "tA@x", 1_700_000_000),
        ];
        let text = encode_body(&items);
        assert!(text.ends_with("},"));
        assert_eq!(decode_body(&text), Some(items));
        assert_eq!(decode_body(""), Some(vec![]));
        assert_eq!(decode_body("{nope"), None);
    }

    #[tokio::test]
    async fn local_chunks() {
        let f = fixture(HashMap::new());
        let tl = f.store.qualify(TL);
        let created = f
            .store
            .create_item(item("m01", &format!("t{TL}"), 1_700_000_000))
            .await
            .unwrap();
        assert_eq!(created.timeline_id, tl);
        assert!(matches!(
            f.store
                .create_item(item("m01", &tl, 1_700_000_000))
                .await,
            Err(Error::AlreadyExists { .. })
        ));
        settle().await;

        let e = Epoch::of_secs(1_700_000_000);
        assert_eq!(e.secs(), 1_699_999_800);
        // the write path warmed the chunk
        assert_eq!(
            f.cache.get(&itr_key(&tl, e)).await.unwrap(),
            Some(e.to_string())
        );

        // a later cursor finds the same iterator via the database
        let later = e.next().next();
        let itrs = f.store.lookup_chunk_itrs(&[tl.clone()], later).await;
        assert_eq!(itrs[&tl], e);
        assert_eq!(
            f.cache.get(&itr_key(&tl, later)).await.unwrap(),
            Some(e.to_string())
        );

        // an earlier cursor finds nothing & memoises that
        assert!(f.store.lookup_chunk_itrs(&[tl.clone()], e.prev()).await.is_empty());
        assert_eq!(
            f.cache.get(&itr_key(&tl, e.prev())).await.unwrap().as_deref(),
            Some(SENTINEL)
        );

        f.cache.delete_prefix("tl:").await.unwrap();
        let bodies = f
            .store
            .load_chunk_bodies(&HashMap::from([(tl.clone(), e)]))
            .await;
        assert_eq!(bodies[&tl].items.len(), 1);
        assert_eq!(bodies[&tl].items[0].resource_id, "m01");
        assert!(f.cache.get(&body_key(&tl, e)).await.unwrap().is_some());

        // a second item lands in the cached body
        f.store
            .create_item(item("m02", &tl, 1_700_000_010))
            .await
            .unwrap();
        settle().await;
        let bodies = f
            .store
            .load_chunk_bodies(&HashMap::from([(tl.clone(), e)]))
            .await;
        let ids = bodies[&tl]
            .items
            .iter()
            .map(|item| item.resource_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["m02", "m01"]);

        // foreign & malformed timelines aren't ours
        assert!(f.store.local_dbid("tABC@elsewhere.example").is_none());
        assert!(f.store.local_dbid("short").is_none());
        assert_eq!(f.store.local_dbid(&tl).as_deref(), Some(TL));
    }

    #[tokio::test]
    async fn removals() {
        let f = fixture(HashMap::new());
        let tl = f.store.qualify(TL);
        f.store
            .create_item(item("m01", &tl, 1_700_000_000))
            .await
            .unwrap();
        assert!(f.store.delete_item(&tl, "m01").await.unwrap());
        assert!(!f.store.delete_item(&tl, "m01").await.unwrap());
        assert!(f.store.get_item(&tl, "m01").await.unwrap().is_none());
        let removed = f.store.list_recently_removed_items(&[tl.clone()]).await;
        assert_eq!(removed[&tl], vec!["m01".to_owned()]);
    }

    #[tokio::test]
    async fn rolling() {
        let f = fixture(HashMap::new());
        let tl = "tzzzzzzzzzzzzzzzzzzzzzzzzzz@peer.example".to_owned();
        let from = Epoch::of_secs(1_700_000_000);
        let to = from.next();
        f.cache
            .set(&itr_key(&tl, from), &from.prev().to_string(), None)
            .await
            .unwrap();
        f.store.roll_epoch(std::slice::from_ref(&tl), from, to).await;
        assert_eq!(
            f.cache.get(&itr_key(&tl, to)).await.unwrap(),
            Some(from.prev().to_string())
        );
        assert_eq!(
            f.cache.get(&body_key(&tl, to)).await.unwrap().as_deref(),
            Some("")
        );
        let relayed = item("m09", &tl, to.secs() + 5);
        f.store.absorb_remote_item(&relayed).await;
        let bodies = f
            .store
            .load_chunk_bodies(&HashMap::from([(tl.clone(), to)]))
            .await;
        assert_eq!(bodies[&tl].items, vec![relayed]);
    }

    #[tokio::test]
    async fn remote_chunks() {
        let server = MockServer::start().await;
        let tl = "t0000000000000000000000000@peer.example".to_owned();
        let old = Epoch::of_secs(1_700_000_000);
        Mock::given(method("GET"))
            .and(path("/api/v1/domain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": {"fqdn": "peer.example", "ccid": "con1x", "dimension": "cc-test"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/timelines/chunks"))
            .and(query_param("time", old.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": {
                    tl.clone(): {
                        "key": "k",
                        "epoch": old.prev().to_string(),
                        "items": [{"resourceID": "mR", "timelineID": tl, "owner": "con1x",
                                   "cdate": "2023-11-14T22:05:00Z"}]
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;
        let current = Epoch::current();
        Mock::given(method("GET"))
            .and(path("/api/v1/timelines/chunks"))
            .and(query_param("time", current.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": {
                    tl.clone(): {"key": "k", "epoch": current.to_string(), "items": []}
                }
            })))
            .mount(&server)
            .await;

        let f = fixture(HashMap::from([(
            "peer.example".to_owned(),
            Url::parse(&server.uri()).unwrap(),
        )]));
        // an old chunk is cached, so the second lookup doesn't reach the peer
        for _ in 0..2 {
            let itrs = f.store.lookup_chunk_itrs(&[tl.clone()], old).await;
            assert_eq!(itrs[&tl], old.prev());
        }
        let bodies = f
            .store
            .load_chunk_bodies(&HashMap::from([(tl.clone(), old.prev())]))
            .await;
        assert_eq!(bodies[&tl].items[0].resource_id, "mR");

        // the current chunk isn't cached unless we're subscribed
        f.store.lookup_chunk_itrs(&[tl.clone()], current).await;
        assert!(f.cache.get(&itr_key(&tl, current)).await.unwrap().is_none());
        f.subs.send_replace(HashSet::from([tl.clone()]));
        f.store.lookup_chunk_itrs(&[tl.clone()], current).await;
        assert_eq!(
            f.cache.get(&itr_key(&tl, current)).await.unwrap(),
            Some(current.to_string())
        );
    }
}
