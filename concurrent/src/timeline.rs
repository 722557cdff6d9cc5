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

//! # timelines
//!
//! The timeline service: reads across sets of timelines (local & remote), posting items, and
//! timeline lifecycle. Callers may name a timeline in any of several ways:
//!
//! - `t<cdid>`: one of ours
//! - `t<cdid>@<fqdn>`: hosted by `fqdn`
//! - `t<cdid>@<ccid>`: hosted by wherever the account `ccid` lives
//! - `<semantic id>@<ccid>`: the timeline `ccid` has given that name
//!
//! all of which [normalize](TimelineService::normalize_timeline_id) to `t<cdid>@<fqdn>`.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use http::StatusCode;
use itertools::Itertools;
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};

use concurrent_shared::{
    api::CheckpointReq,
    cdid::{is_seems_cdid, Cdid},
    documents::{resource_cdid, Body, Document, EventBody},
    entities::{is_ccid, split_qualified, Chunk, Entity, Event, SemanticId, Timeline, TimelineItem},
    epoch::Epoch,
};

use crate::{
    cache::{self, Cache},
    chunk_store::{self, ChunkStore},
    key_chain::{self, KeyChain},
    peer::{self, Peers},
    policy::{PolicyEngine, RequestContext},
    pubsub::Bus,
    storage::{self, Backend as StorageBackend, ItemQuery},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{reference} is not a valid timeline reference"))]
    BadReference {
        reference: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to publish to {channel}: {source}"))]
    Bus {
        channel: String,
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Chunk store error: {source}"))]
    Chunk {
        source: chunk_store::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{action} on {timeline} is not permitted"))]
    Forbidden {
        action: &'static str,
        timeline: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The item does not match the document carrying it"))]
    ItemMismatch { backtrace: Backtrace },
    #[snafu(display("Failed to serialize: {source}"))]
    Json {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Signature validation failed: {source}"))]
    KeyChain {
        #[snafu(source(from(key_chain::Error, Box::new)))]
        source: Box<key_chain::Error>,
        backtrace: Backtrace,
    },
    #[snafu(display("{timeline} is not hosted here"))]
    NotLocal {
        timeline: String,
        backtrace: Backtrace,
    },
    #[snafu(display("No such timeline or item: {what}"))]
    NotFound { what: String, backtrace: Backtrace },
    #[snafu(display("While talking to {fqdn}: {source}"))]
    Peer {
        fqdn: String,
        source: peer::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The semantic id {semantic_id} already names {existing}"))]
    SemanticIdMismatch {
        semantic_id: String,
        existing: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadReference { .. } | Error::ItemMismatch { .. } | Error::NotLocal { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Chunk {
                source: chunk_store::Error::AlreadyExists { .. },
                ..
            }
            | Error::SemanticIdMismatch { .. } => StatusCode::CONFLICT,
            Error::Chunk {
                source: chunk_store::Error::NotLocal { .. },
                ..
            } => StatusCode::BAD_REQUEST,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::KeyChain { source, .. } => source.status(),
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Peer { source, .. } if source.is_not_found() => StatusCode::NOT_FOUND,
            Error::Peer { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Normalized references are remembered this long
const NORMALIZATION_TTL: Duration = Duration::from_secs(15 * 60);
/// Remote timeline metadata is remembered this long
const REMOTE_TIMELINE_TTL: Duration = Duration::from_secs(5 * 60);
/// [get_recent_items](TimelineService::get_recent_items) walks back at most this many chunks
const MAX_ITERATIONS: usize = 6;

/// Newest first, ties broken by resource id (also descending)
fn newest_first(lhs: &TimelineItem, rhs: &TimelineItem) -> std::cmp::Ordering {
    rhs.cdate
        .cmp(&lhs.cdate)
        .then_with(|| rhs.resource_id.cmp(&lhs.resource_id))
}

/// Parse an optional JSON-encoded string (a timeline's policy parameters, say)
fn parse_embedded(text: Option<&str>) -> Value {
    text.and_then(|text| match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Ignoring unparseable embedded JSON: {err}");
            None
        }
    })
    .unwrap_or(Value::Null)
}

fn parse_defaults(text: Option<&str>) -> Option<HashMap<String, bool>> {
    text.and_then(|text| serde_json::from_str(text).ok())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        TimelineService                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct TimelineService {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    cache: Arc<dyn Cache + Send + Sync>,
    bus: Arc<dyn Bus + Send + Sync>,
    chunks: Arc<ChunkStore>,
    peers: Arc<Peers>,
    policy: Arc<PolicyEngine>,
    key_chain: Arc<KeyChain>,
    fqdn: String,
    /// Accounts granted the `_admin` tag
    admins: HashSet<String>,
}

impl TimelineService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        cache: Arc<dyn Cache + Send + Sync>,
        bus: Arc<dyn Bus + Send + Sync>,
        chunks: Arc<ChunkStore>,
        peers: Arc<Peers>,
        policy: Arc<PolicyEngine>,
        key_chain: Arc<KeyChain>,
        fqdn: &str,
    ) -> TimelineService {
        TimelineService {
            storage,
            cache,
            bus,
            chunks,
            peers,
            policy,
            key_chain,
            fqdn: fqdn.to_owned(),
            admins: HashSet::new(),
        }
    }

    pub fn with_admins<I: IntoIterator<Item = String>>(mut self, admins: I) -> TimelineService {
        self.admins = admins.into_iter().collect();
        self
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// The domain hosting the (normalized) `timeline`
    fn host_of(timeline: &str) -> Option<&str> {
        split_qualified(timeline).1
    }

    fn is_local(&self, timeline: &str) -> bool {
        Self::host_of(timeline) == Some(self.fqdn.as_str())
    }

    /// The database id of the normalized `timeline`, which must be ours
    fn local_dbid(&self, timeline: &str) -> Result<String> {
        self.chunks
            .local_dbid(timeline)
            .context(NotLocalSnafu { timeline })
    }

    /// Our timeline, as presented to the world (`t<cdid>`)
    fn external(mut timeline: Timeline) -> Timeline {
        if timeline.id.len() == 26 {
            timeline.id = format!("t{}", timeline.id);
        }
        timeline
    }

    /// Assemble the policy context for a request made by `ccid`
    ///
    /// Accounts we've never heard of are presumed to be local.
    pub async fn requester(&self, ccid: &str) -> Result<RequestContext> {
        let mut requester = match self.storage.get_entity(ccid).await.context(StorageSnafu)? {
            Some(entity) => entity,
            None => Entity {
                ccid: ccid.to_owned(),
                domain: self.fqdn.clone(),
                tag: String::new(),
                alias: None,
                cdate: Utc::now(),
            },
        };
        if self.admins.contains(ccid) && !requester.has_tag("_admin") {
            requester.tag = if requester.tag.is_empty() {
                "_admin".to_owned()
            } else {
                format!("{},_admin", requester.tag)
            };
        }
        let requester_domain = self
            .storage
            .get_domain(&requester.domain)
            .await
            .context(StorageSnafu)?;
        Ok(RequestContext {
            requester: Some(requester),
            requester_domain,
            ..Default::default()
        })
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // normalization
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Reduce any form of timeline reference to `t<cdid>@<fqdn>`
    #[instrument(skip(self))]
    pub async fn normalize_timeline_id(&self, reference: &str) -> Result<String> {
        let key = format!("tl:norm:{reference}");
        match self.cache.get(&key).await {
            Ok(Some(normalized)) => return Ok(normalized),
            Ok(None) => (),
            Err(err) => warn!("Failed to consult the normalization cache: {err}"),
        }
        let normalized = self.normalize_uncached(reference).await?;
        if let Err(err) = self
            .cache
            .set(&key, &normalized, Some(NORMALIZATION_TTL))
            .await
        {
            warn!("Failed to cache the normalization of {reference}: {err}");
        }
        Ok(normalized)
    }

    async fn normalize_uncached(&self, reference: &str) -> Result<String> {
        let (id, resolver) = split_qualified(reference);
        let owner = resolver.filter(|resolver| is_ccid(resolver));
        let host = match (resolver, owner) {
            (None, _) => self.fqdn.clone(),
            (Some(_), Some(ccid)) => match self.storage.get_entity(ccid).await.context(StorageSnafu)? {
                Some(entity) => entity.domain,
                None => self.fqdn.clone(),
            },
            (Some(fqdn), None) => fqdn.to_owned(),
        };

        if is_seems_cdid(id, 't') {
            return Ok(format!("{id}@{host}"));
        }
        if id.parse::<Cdid>().is_ok() {
            return Ok(format!("t{id}@{host}"));
        }
        let ccid = owner.context(BadReferenceSnafu { reference })?;
        if let Some(semantic_id) = self
            .storage
            .get_semantic_id(id, ccid)
            .await
            .context(StorageSnafu)?
        {
            let (target, _) = split_qualified(&semantic_id.target);
            return Ok(if target.starts_with('t') {
                format!("{target}@{host}")
            } else {
                format!("t{target}@{host}")
            });
        }
        if host != self.fqdn {
            // Let the owner's home resolve its own names
            let timeline = self
                .peers
                .get_timeline(&host, reference)
                .await
                .context(PeerSnafu { fqdn: host.clone() })?;
            let (target, _) = split_qualified(&timeline.id);
            let target = target.strip_prefix('t').unwrap_or(target);
            return Ok(format!("t{target}@{host}"));
        }
        NotFoundSnafu { what: reference }.fail()
    }

    /// Normalize each of `references`, dropping (with a warning) any that can't be, and removing
    /// duplicates
    pub async fn normalize_all(&self, references: &[String]) -> Vec<String> {
        let mut normalized = Vec::with_capacity(references.len());
        for reference in references {
            match self.normalize_timeline_id(reference).await {
                Ok(timeline) => normalized.push(timeline),
                Err(err) => warn!("Dropping the timeline reference {reference}: {err}"),
            }
        }
        normalized.into_iter().unique().collect()
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // reads
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// The newest (at most `limit`) items strictly older than `until` across `timelines`
    ///
    /// Walks each timeline back chunk by chunk, all timelines in lock-step, until the items seen
    /// so far suffice to fill `limit` (or the timelines are exhausted).
    #[instrument(skip(self, timelines), fields(n = timelines.len()))]
    pub async fn get_recent_items(
        &self,
        timelines: &[String],
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let timelines = self.normalize_all(timelines).await;
        let mut cursors: HashMap<String, Epoch> = timelines
            .iter()
            .map(|timeline| (timeline.clone(), Epoch::of(&until)))
            .collect();
        let removed = self.chunks.list_recently_removed_items(&timelines).await;
        let is_live = |item: &TimelineItem| {
            removed
                .get(&item.timeline_id)
                .is_none_or(|removed| !removed.contains(&item.resource_id))
        };
        let mut collected: Vec<TimelineItem> = Vec::new();

        for iteration in 0..MAX_ITERATIONS {
            if cursors.is_empty() {
                break;
            }
            let mut itrs = HashMap::new();
            for (epoch, group) in cursors
                .iter()
                .map(|(timeline, epoch)| (*epoch, timeline.clone()))
                .into_group_map()
            {
                itrs.extend(self.chunks.lookup_chunk_itrs(&group, epoch).await);
            }
            cursors.retain(|timeline, _| itrs.contains_key(timeline));

            let mut bodies = self.chunks.load_chunk_bodies(&itrs).await;
            for (timeline, itr) in &itrs {
                if let Some(chunk) = bodies.remove(timeline) {
                    collected.extend(chunk.items.into_iter().filter(is_live));
                }
                cursors.insert(timeline.clone(), itr.prev());
            }

            // Everything at or after the frontier has been read for every live timeline
            let frontier = cursors.values().max().map(Epoch::end);
            let complete = collected
                .iter()
                .filter(|item| item.cdate < until && frontier.is_none_or(|f| item.cdate >= f))
                .count();
            debug!("iteration {iteration}: {complete} complete items, frontier {frontier:?}");
            if complete >= limit {
                break;
            }
        }

        let mut items = collected
            .into_iter()
            .filter(|item| item.cdate < until)
            .unique_by(|item| item.resource_id.clone())
            .collect::<Vec<_>>();
        items.sort_by(newest_first);
        items.truncate(limit);
        Ok(items)
    }

    /// Items across `timelines` created strictly after `since` (& strictly before `until`, if
    /// given), oldest first
    #[instrument(skip(self, timelines), fields(n = timelines.len()))]
    pub async fn get_immediate_items(
        &self,
        timelines: &[String],
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let timelines = self.normalize_all(timelines).await;
        let (local, remote): (Vec<String>, Vec<String>) = timelines
            .into_iter()
            .partition(|timeline| self.is_local(timeline));
        let mut items = self
            .chunks
            .local_items_after(&local, &since, limit)
            .await
            .context(ChunkSnafu)?;
        for (host, timelines) in remote
            .into_iter()
            .filter_map(|timeline| Self::host_of(&timeline).map(|host| (host.to_owned(), timeline.clone())))
            .into_group_map()
        {
            match self
                .peers
                .get_range(
                    &host,
                    &timelines,
                    since.timestamp(),
                    until.map(|until| until.timestamp()),
                    limit,
                )
                .await
            {
                Ok(fetched) => items.extend(fetched),
                Err(err) => warn!("Failed to read forward from {host}: {err}"),
            }
        }
        let mut items = items
            .into_iter()
            .filter(|item| item.cdate > since && until.is_none_or(|until| item.cdate < until))
            .unique_by(|item| item.resource_id.clone())
            .collect::<Vec<_>>();
        items.sort_by(|lhs, rhs| newest_first(rhs, lhs));
        items.truncate(limit);
        Ok(items)
    }

    /// The chunk enclosing or preceding `until` for each of our `timelines`; served to peers
    #[instrument(skip(self, timelines), fields(n = timelines.len()))]
    pub async fn get_chunks(
        &self,
        timelines: &[String],
        until: DateTime<Utc>,
    ) -> Result<HashMap<String, Chunk>> {
        let local = self
            .normalize_all(timelines)
            .await
            .into_iter()
            .filter(|timeline| self.is_local(timeline))
            .collect::<Vec<_>>();
        let itrs = self
            .chunks
            .lookup_chunk_itrs(&local, Epoch::of(&until))
            .await;
        Ok(self.chunks.load_chunk_bodies(&itrs).await)
    }

    /// Timeline metadata; remote timelines are fetched from their host & cached
    #[instrument(skip(self))]
    pub async fn get_timeline(&self, reference: &str) -> Result<Timeline> {
        let timeline = self.normalize_timeline_id(reference).await?;
        if self.is_local(&timeline) {
            let dbid = self.local_dbid(&timeline)?;
            return self
                .storage
                .get_timeline(&dbid)
                .await
                .context(StorageSnafu)?
                .map(Self::external)
                .context(NotFoundSnafu { what: timeline });
        }

        let key = format!("tl:data:{timeline}");
        if let Ok(Some(text)) = self.cache.get(&key).await {
            match serde_json::from_str::<Timeline>(&text) {
                Ok(cached) => return Ok(cached),
                Err(err) => warn!("Discarding cached metadata for {timeline}: {err}"),
            }
        }
        let host = Self::host_of(&timeline)
            .context(BadReferenceSnafu {
                reference: timeline.clone(),
            })?
            .to_owned();
        let (id, _) = split_qualified(&timeline);
        let fetched = self
            .peers
            .get_timeline(&host, id)
            .await
            .context(PeerSnafu { fqdn: host.clone() })?;
        match serde_json::to_string(&fetched) {
            Ok(text) => {
                if let Err(err) = self.cache.set(&key, &text, Some(REMOTE_TIMELINE_TTL)).await {
                    warn!("Failed to cache metadata for {timeline}: {err}");
                }
            }
            Err(err) => warn!("{err}"),
        }
        Ok(fetched)
    }

    pub async fn list_timelines_by_schema(&self, schema: &str) -> Result<Vec<Timeline>> {
        Ok(self
            .storage
            .timelines_by_schema(schema)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(Self::external)
            .collect())
    }

    pub async fn list_timelines_by_author(&self, author: &str) -> Result<Vec<Timeline>> {
        Ok(self
            .storage
            .timelines_by_author(author)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(Self::external)
            .collect())
    }

    /// Items in one of our timelines matching `query`, newest first
    pub async fn query(&self, reference: &str, query: &ItemQuery) -> Result<Vec<TimelineItem>> {
        let timeline = self.normalize_timeline_id(reference).await?;
        let dbid = self.local_dbid(&timeline)?;
        Ok(self
            .storage
            .query_items(&dbid, query)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(|mut item| {
                item.timeline_id = timeline.clone();
                item
            })
            .collect())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // writes
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// The policy context for acting on our `timeline`
    fn timeline_context(
        &self,
        mut ctx: RequestContext,
        timeline: &Timeline,
        document: &str,
    ) -> Result<RequestContext> {
        ctx.this = serde_json::to_value(timeline).context(JsonSnafu)?;
        ctx.params = parse_embedded(timeline.policy_params.as_deref());
        ctx.document = parse_embedded(Some(document));
        Ok(ctx)
    }

    async fn authorise(
        &self,
        action: &'static str,
        timeline: &Timeline,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<()> {
        let defaults = parse_defaults(timeline.policy_defaults.as_deref());
        if self
            .policy
            .decide(timeline.policy.as_deref(), ctx, action, defaults.as_ref())
            .await
        {
            Ok(())
        } else {
            info!(
                principal = ctx.requester.as_ref().map(|r| r.ccid.as_str()).unwrap_or(""),
                "{action} on {name} refused"
            );
            ForbiddenSnafu {
                action,
                timeline: name,
            }
            .fail()
        }
    }

    async fn local_timeline(&self, timeline: &str) -> Result<Timeline> {
        let dbid = self.local_dbid(timeline)?;
        self.storage
            .get_timeline(&dbid)
            .await
            .context(StorageSnafu)?
            .context(NotFoundSnafu { what: timeline })
    }

    /// Post `item` into the timeline named by `reference`
    ///
    /// Items for our own timelines are checked against the timeline's policy, persisted &
    /// published; items for remote timelines are forwarded to their host. Re-posting an item
    /// that's already present is not an error.
    #[instrument(skip(self, item, document, signature, ctx), fields(resource = %item.resource_id))]
    pub async fn post_item(
        &self,
        reference: &str,
        mut item: TimelineItem,
        document: &str,
        signature: &str,
        ctx: RequestContext,
    ) -> Result<TimelineItem> {
        let timeline = self.normalize_timeline_id(reference).await?;
        item.timeline_id = timeline.clone();
        if !self.is_local(&timeline) {
            let host = Self::host_of(&timeline)
                .context(BadReferenceSnafu {
                    reference: timeline.clone(),
                })?
                .to_owned();
            self.peers
                .post_checkpoint(
                    &host,
                    &CheckpointReq {
                        timeline: timeline.clone(),
                        item: item.clone(),
                        document: document.to_owned(),
                        signature: signature.to_owned(),
                    },
                )
                .await
                .context(PeerSnafu { fqdn: host })?;
            return Ok(item);
        }

        let stored = self.local_timeline(&timeline).await?;
        let mut ctx = self.timeline_context(ctx, &stored, document)?;
        ctx.resource = serde_json::to_value(&item).context(JsonSnafu)?;
        self.authorise("timeline.distribute", &stored, &ctx, &timeline)
            .await?;

        let created = match self.chunks.create_item(item.clone()).await {
            Ok(created) => created,
            Err(chunk_store::Error::AlreadyExists { .. }) => {
                debug!("{} is already in {timeline}", item.resource_id);
                return Ok(item);
            }
            Err(err) => return Err(err).context(ChunkSnafu),
        };
        self.publish(&Event {
            timeline: timeline.clone(),
            item: Some(created.clone()),
            resource: None,
            document: document.to_owned(),
            signature: signature.to_owned(),
        })
        .await?;
        Ok(created)
    }

    /// An item pushed to us by a peer on behalf of one of its users
    #[instrument(skip(self, req), fields(timeline = %req.timeline))]
    pub async fn checkpoint(&self, req: CheckpointReq) -> Result<TimelineItem> {
        let doc = self
            .key_chain
            .validate_signed_object(&req.document, &req.signature)
            .await
            .context(KeyChainSnafu)?;
        let timeline = self.normalize_timeline_id(&req.timeline).await?;
        if !self.is_local(&timeline) {
            return NotLocalSnafu { timeline }.fail();
        }
        if req.item.owner != doc.header.owner() {
            return ItemMismatchSnafu.fail();
        }
        let ctx = self.requester(&doc.header.signer).await?;
        self.post_item(&timeline, req.item, &req.document, &req.signature, ctx)
            .await
    }

    /// Broadcast a client-supplied event on one of our timelines
    ///
    /// The event must carry a valid signed document; any item it names must have been derived
    /// from that document, & the requester must be allowed to distribute on the timeline.
    #[instrument(skip(self, body, ctx), fields(timeline = %body.timeline))]
    pub async fn distribute_event(&self, body: &EventBody, ctx: RequestContext) -> Result<Event> {
        let timeline = self.normalize_timeline_id(&body.timeline).await?;
        if !self.is_local(&timeline) {
            return NotLocalSnafu { timeline }.fail();
        }
        let inner = self
            .key_chain
            .validate_signed_object(&body.document, &body.signature)
            .await
            .context(KeyChainSnafu)?;
        if let Some(item) = &body.item {
            let header = &inner.header;
            let derived = item
                .resource_type()
                .map(|prefix| resource_cdid(&body.document, &header.signed_at).with_prefix(prefix));
            if item.owner != header.owner()
                || item.author.as_deref().is_some_and(|author| author != header.signer)
                || derived.as_deref() != Some(item.resource_id.as_str())
                || item.cdate != header.signed_at
            {
                return ItemMismatchSnafu.fail();
            }
        }

        let stored = self.local_timeline(&timeline).await?;
        let mut ctx = self.timeline_context(ctx, &stored, &body.document)?;
        ctx.resource = match &body.item {
            Some(item) => serde_json::to_value(item).context(JsonSnafu)?,
            None => body.resource.clone().unwrap_or_default(),
        };
        self.authorise("timeline.distribute", &stored, &ctx, &timeline)
            .await?;

        let event = Event {
            item: body.item.clone().map(|mut item| {
                item.timeline_id = timeline.clone();
                item
            }),
            timeline,
            resource: body.resource.clone(),
            document: body.document.clone(),
            signature: body.signature.clone(),
        };
        self.publish(&event).await?;
        Ok(event)
    }

    /// Publish `event` on its timeline's channel
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event).context(JsonSnafu)?;
        self.bus
            .publish(&event.timeline, &payload)
            .await
            .context(BusSnafu {
                channel: event.timeline.clone(),
            })
    }

    /// Create or update one of our timelines from a `timeline` document
    #[instrument(skip_all, fields(signer = %doc.header.signer))]
    pub async fn upsert_timeline(
        &self,
        doc: &Document,
        document: &str,
        signature: &str,
        ctx: RequestContext,
    ) -> Result<Timeline> {
        let Body::Timeline(body) = &doc.body else {
            return ItemMismatchSnafu.fail();
        };
        let header = &doc.header;

        let mut id = match header.id.as_deref() {
            Some(id) => Some(
                self.chunks
                    .local_dbid(id)
                    .context(NotLocalSnafu { timeline: id })?,
            ),
            None => None,
        };
        if let Some(semantic_id) = header.semantic_id.as_deref() {
            if let Some(existing) = self
                .storage
                .get_semantic_id(semantic_id, &header.signer)
                .await
                .context(StorageSnafu)?
            {
                let target = self.chunks.local_dbid(&existing.target);
                let live = match target.as_deref() {
                    Some(target) => self
                        .storage
                        .get_timeline(target)
                        .await
                        .context(StorageSnafu)?
                        .is_some(),
                    None => false,
                };
                if live {
                    if let (Some(current), Some(target)) = (&id, &target) {
                        if current != target {
                            return SemanticIdMismatchSnafu {
                                semantic_id,
                                existing: target.clone(),
                            }
                            .fail();
                        }
                    }
                    if id.is_none() {
                        id = target;
                    }
                }
            }
        }
        let id = id.unwrap_or_else(|| resource_cdid(document, &header.signed_at).to_string());

        let existing = self.storage.get_timeline(&id).await.context(StorageSnafu)?;
        let now = Utc::now();
        let timeline = Timeline {
            id: id.clone(),
            indexable: body.indexable,
            owner: header.owner().to_owned(),
            author: header.signer.clone(),
            schema: header.schema.clone().unwrap_or_default(),
            policy: header.policy.clone(),
            policy_params: header.policy_params.clone(),
            policy_defaults: header.policy_defaults.clone(),
            document: document.to_owned(),
            signature: signature.to_owned(),
            cdate: now,
            mdate: now,
            domain_owned: body.domain_owned,
        };
        let name = self.chunks.qualify(&id);
        match &existing {
            Some(existing) => {
                let ctx = self.timeline_context(ctx, existing, document)?;
                self.authorise("timeline.update", existing, &ctx, &name)
                    .await?;
            }
            None => {
                let mut ctx = ctx;
                ctx.document = parse_embedded(Some(document));
                if !self
                    .policy
                    .decide(None, &ctx, "timeline.create", None)
                    .await
                {
                    return ForbiddenSnafu {
                        action: "timeline.create",
                        timeline: name,
                    }
                    .fail();
                }
            }
        }

        let saved = self
            .storage
            .upsert_timeline(&timeline)
            .await
            .context(StorageSnafu)?;
        if let Some(semantic_id) = header.semantic_id.as_deref() {
            self.storage
                .upsert_semantic_id(&SemanticId {
                    id: semantic_id.to_owned(),
                    owner: header.signer.clone(),
                    target: format!("t{id}"),
                    document: document.to_owned(),
                    signature: signature.to_owned(),
                    cdate: now,
                    mdate: now,
                })
                .await
                .context(StorageSnafu)?;
        }
        info!("Upserted timeline {name}");
        Ok(Self::external(saved))
    }

    /// Delete one of our timelines, along with its items
    #[instrument(skip(self, document, ctx))]
    pub async fn delete_timeline(
        &self,
        reference: &str,
        document: &str,
        ctx: RequestContext,
    ) -> Result<()> {
        let timeline = self.normalize_timeline_id(reference).await?;
        let stored = self.local_timeline(&timeline).await?;
        let ctx = self.timeline_context(ctx, &stored, document)?;
        self.authorise("timeline.delete", &stored, &ctx, &timeline)
            .await?;
        self.storage
            .delete_timeline(&stored.id)
            .await
            .context(StorageSnafu)?;
        self.chunks.forget_timeline(&timeline).await;
        info!("Deleted timeline {timeline}");
        Ok(())
    }

    /// Remove `resource` from one of our timelines
    #[instrument(skip(self, document, signature, ctx))]
    pub async fn retract(
        &self,
        reference: &str,
        resource: &str,
        document: &str,
        signature: &str,
        ctx: RequestContext,
    ) -> Result<()> {
        let timeline = self.normalize_timeline_id(reference).await?;
        let stored = self.local_timeline(&timeline).await?;
        let item = self
            .chunks
            .get_item(&timeline, resource)
            .await
            .context(ChunkSnafu)?
            .context(NotFoundSnafu {
                what: format!("{resource} in {timeline}"),
            })?;
        let mut ctx = self.timeline_context(ctx, &stored, document)?;
        ctx.resource = serde_json::to_value(&item).context(JsonSnafu)?;
        self.authorise("timeline.retract", &stored, &ctx, &timeline)
            .await?;
        self.chunks
            .delete_item(&timeline, resource)
            .await
            .context(ChunkSnafu)?;
        self.publish(&Event {
            timeline: timeline.clone(),
            item: None,
            resource: Some(serde_json::json!({"retracted": resource})),
            document: document.to_owned(),
            signature: signature.to_owned(),
        })
        .await
    }
}
