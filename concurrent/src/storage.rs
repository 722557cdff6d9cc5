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

//! # storage
//!
//! Abstractions for the concurrent storage layer: the durable home of timelines, their items, keys,
//! and the entities, domains & semantic ids the timeline subsystem consults. Implementations live
//! in [memory](crate::memory) & [postgres](crate::postgres).
//!
//! Items are stored with their *bare* timeline id (the twenty-six character CDID); qualifying them
//! with the owning domain is the business of the [chunk store](crate::chunk_store).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use concurrent_shared::entities::{Domain, Entity, Key, SemanticId, Timeline, TimelineItem};

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

/// Filters for [Backend::query_items]
#[derive(Clone, Debug, Default)]
pub struct ItemQuery {
    pub schema: Option<String>,
    pub owner: Option<String>,
    pub author: Option<String>,
    /// Only items strictly older than this
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl ItemQuery {
    pub fn matches(&self, item: &TimelineItem) -> bool {
        self.schema
            .as_ref()
            .is_none_or(|s| item.schema.as_ref() == Some(s))
            && self.owner.as_ref().is_none_or(|o| &item.owner == o)
            && self
                .author
                .as_ref()
                .is_none_or(|a| item.author.as_ref() == Some(a))
            && self.until.is_none_or(|u| item.cdate < u)
    }
}

#[async_trait]
pub trait Backend {
    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Timeline items
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Insert `item`; return false (and change nothing) if `(timeline_id, resource_id)` is
    /// already present
    async fn create_item(&self, item: &TimelineItem) -> Result<bool, Error>;
    async fn get_item(&self, timeline: &str, resource: &str)
        -> Result<Option<TimelineItem>, Error>;
    /// Remove an item; return false if there was no such item
    async fn delete_item(&self, timeline: &str, resource: &str) -> Result<bool, Error>;
    /// For each of `timelines`, the creation time of its newest item strictly older than
    /// `before`; timelines with no such item are absent from the result
    async fn latest_item_times(
        &self,
        timelines: &[String],
        before: &DateTime<Utc>,
    ) -> Result<HashMap<String, DateTime<Utc>>, Error>;
    /// Items in `timeline` created in `[start, end)`, newest first, at most `limit` of them
    async fn items_in_range(
        &self,
        timeline: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>, Error>;
    /// Items in any of `timelines` created strictly after `since`, oldest first
    async fn items_after(
        &self,
        timelines: &[String],
        since: &DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>, Error>;
    /// Items in `timeline` matching `query`, newest first
    async fn query_items(
        &self,
        timeline: &str,
        query: &ItemQuery,
    ) -> Result<Vec<TimelineItem>, Error>;

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Timelines
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Create or replace a timeline; `cdate` is preserved across updates
    async fn upsert_timeline(&self, timeline: &Timeline) -> Result<Timeline, Error>;
    async fn get_timeline(&self, id: &str) -> Result<Option<Timeline>, Error>;
    /// Delete a timeline along with all its items
    async fn delete_timeline(&self, id: &str) -> Result<bool, Error>;
    /// Indexable timelines using `schema`
    async fn timelines_by_schema(&self, schema: &str) -> Result<Vec<Timeline>, Error>;
    async fn timelines_by_author(&self, author: &str) -> Result<Vec<Timeline>, Error>;

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Keys
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Record a newly-enacted key; return false if a key by that id already exists
    async fn enact_key(&self, key: &Key) -> Result<bool, Error>;
    async fn get_key(&self, id: &str) -> Result<Option<Key>, Error>;
    /// Mark a key revoked. A key that's already revoked is returned unchanged; None means there is
    /// no such key.
    async fn revoke_key(
        &self,
        id: &str,
        document: &str,
        signature: &str,
        at: &DateTime<Utc>,
    ) -> Result<Option<Key>, Error>;

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Entities, domains & semantic ids
    ////////////////////////////////////////////////////////////////////////////////////////////////

    async fn get_entity(&self, ccid: &str) -> Result<Option<Entity>, Error>;
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), Error>;
    async fn get_domain(&self, fqdn: &str) -> Result<Option<Domain>, Error>;
    async fn upsert_domain(&self, domain: &Domain) -> Result<(), Error>;
    async fn get_semantic_id(&self, id: &str, owner: &str) -> Result<Option<SemanticId>, Error>;
    async fn upsert_semantic_id(&self, semantic_id: &SemanticId) -> Result<(), Error>;

    /// Cheap round-trip to the datastore, for health checks
    async fn ping(&self) -> Result<(), Error>;
}
