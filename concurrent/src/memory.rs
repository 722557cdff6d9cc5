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

//! [Backend] implementation that keeps everything in process memory
//!
//! Used for single-node deployments & throughout the test suite. Nothing survives a restart.
//!
//! [Backend]: crate::storage::Backend

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use concurrent_shared::entities::{Domain, Entity, Key, SemanticId, Timeline, TimelineItem};

use crate::storage::{self, Error as StorError, ItemQuery};

type StdResult<T, E> = std::result::Result<T, E>;

#[derive(Default)]
struct Tables {
    timelines: HashMap<String, Timeline>,
    /// timeline id => resource id => item
    items: HashMap<String, BTreeMap<String, TimelineItem>>,
    keys: HashMap<String, Key>,
    entities: HashMap<String, Entity>,
    domains: HashMap<String, Domain>,
    /// (id, owner) => semantic id
    semantic_ids: HashMap<(String, String), SemanticId>,
}

/// Newest first, ties broken by resource id (descending)
fn newest_first(lhs: &TimelineItem, rhs: &TimelineItem) -> std::cmp::Ordering {
    rhs.cdate
        .cmp(&lhs.cdate)
        .then_with(|| rhs.resource_id.cmp(&lhs.resource_id))
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
}

#[async_trait]
impl storage::Backend for MemoryBackend {
    async fn create_item(&self, item: &TimelineItem) -> StdResult<bool, StorError> {
        let mut tables = self.tables.lock().await;
        let items = tables.items.entry(item.timeline_id.clone()).or_default();
        if items.contains_key(&item.resource_id) {
            return Ok(false);
        }
        items.insert(item.resource_id.clone(), item.clone());
        Ok(true)
    }

    async fn get_item(
        &self,
        timeline: &str,
        resource: &str,
    ) -> StdResult<Option<TimelineItem>, StorError> {
        Ok(self
            .tables
            .lock()
            .await
            .items
            .get(timeline)
            .and_then(|items| items.get(resource))
            .cloned())
    }

    async fn delete_item(&self, timeline: &str, resource: &str) -> StdResult<bool, StorError> {
        Ok(self
            .tables
            .lock()
            .await
            .items
            .get_mut(timeline)
            .and_then(|items| items.remove(resource))
            .is_some())
    }

    async fn latest_item_times(
        &self,
        timelines: &[String],
        before: &DateTime<Utc>,
    ) -> StdResult<HashMap<String, DateTime<Utc>>, StorError> {
        let tables = self.tables.lock().await;
        Ok(timelines
            .iter()
            .filter_map(|tl| {
                tables
                    .items
                    .get(tl)?
                    .values()
                    .filter(|item| &item.cdate < before)
                    .map(|item| item.cdate)
                    .max()
                    .map(|latest| (tl.clone(), latest))
            })
            .collect())
    }

    async fn items_in_range(
        &self,
        timeline: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        limit: usize,
    ) -> StdResult<Vec<TimelineItem>, StorError> {
        let tables = self.tables.lock().await;
        let mut items: Vec<TimelineItem> = tables
            .items
            .get(timeline)
            .into_iter()
            .flat_map(|items| items.values())
            .filter(|item| &item.cdate >= start && &item.cdate < end)
            .cloned()
            .collect();
        items.sort_by(newest_first);
        items.truncate(limit);
        Ok(items)
    }

    async fn items_after(
        &self,
        timelines: &[String],
        since: &DateTime<Utc>,
        limit: usize,
    ) -> StdResult<Vec<TimelineItem>, StorError> {
        let tables = self.tables.lock().await;
        let mut items: Vec<TimelineItem> = timelines
            .iter()
            .filter_map(|tl| tables.items.get(tl))
            .flat_map(|items| items.values())
            .filter(|item| &item.cdate > since)
            .cloned()
            .collect();
        items.sort_by(|lhs, rhs| newest_first(rhs, lhs));
        items.truncate(limit);
        Ok(items)
    }

    async fn query_items(
        &self,
        timeline: &str,
        query: &ItemQuery,
    ) -> StdResult<Vec<TimelineItem>, StorError> {
        let tables = self.tables.lock().await;
        let mut items: Vec<TimelineItem> = tables
            .items
            .get(timeline)
            .into_iter()
            .flat_map(|items| items.values())
            .filter(|item| query.matches(item))
            .cloned()
            .collect();
        items.sort_by(newest_first);
        items.truncate(query.limit);
        Ok(items)
    }

    async fn upsert_timeline(&self, timeline: &Timeline) -> StdResult<Timeline, StorError> {
        let mut tables = self.tables.lock().await;
        let mut timeline = timeline.clone();
        if let Some(prior) = tables.timelines.get(&timeline.id) {
            timeline.cdate = prior.cdate;
        }
        tables
            .timelines
            .insert(timeline.id.clone(), timeline.clone());
        Ok(timeline)
    }

    async fn get_timeline(&self, id: &str) -> StdResult<Option<Timeline>, StorError> {
        Ok(self.tables.lock().await.timelines.get(id).cloned())
    }

    async fn delete_timeline(&self, id: &str) -> StdResult<bool, StorError> {
        let mut tables = self.tables.lock().await;
        tables.items.remove(id);
        Ok(tables.timelines.remove(id).is_some())
    }

    async fn timelines_by_schema(&self, schema: &str) -> StdResult<Vec<Timeline>, StorError> {
        Ok(self
            .tables
            .lock()
            .await
            .timelines
            .values()
            .filter(|tl| tl.indexable && tl.schema == schema)
            .cloned()
            .collect())
    }

    async fn timelines_by_author(&self, author: &str) -> StdResult<Vec<Timeline>, StorError> {
        Ok(self
            .tables
            .lock()
            .await
            .timelines
            .values()
            .filter(|tl| tl.author == author)
            .cloned()
            .collect())
    }

    async fn enact_key(&self, key: &Key) -> StdResult<bool, StorError> {
        let mut tables = self.tables.lock().await;
        if tables.keys.contains_key(&key.id) {
            return Ok(false);
        }
        tables.keys.insert(key.id.clone(), key.clone());
        Ok(true)
    }

    async fn get_key(&self, id: &str) -> StdResult<Option<Key>, StorError> {
        Ok(self.tables.lock().await.keys.get(id).cloned())
    }

    async fn revoke_key(
        &self,
        id: &str,
        document: &str,
        signature: &str,
        at: &DateTime<Utc>,
    ) -> StdResult<Option<Key>, StorError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.keys.get_mut(id).map(|key| {
            if !key.is_revoked() {
                key.revoke_document = Some(document.to_owned());
                key.revoke_signature = Some(signature.to_owned());
                key.valid_until = Some(*at);
            }
            key.clone()
        }))
    }

    async fn get_entity(&self, ccid: &str) -> StdResult<Option<Entity>, StorError> {
        Ok(self.tables.lock().await.entities.get(ccid).cloned())
    }

    async fn upsert_entity(&self, entity: &Entity) -> StdResult<(), StorError> {
        self.tables
            .lock()
            .await
            .entities
            .insert(entity.ccid.clone(), entity.clone());
        Ok(())
    }

    async fn get_domain(&self, fqdn: &str) -> StdResult<Option<Domain>, StorError> {
        Ok(self.tables.lock().await.domains.get(fqdn).cloned())
    }

    async fn upsert_domain(&self, domain: &Domain) -> StdResult<(), StorError> {
        self.tables
            .lock()
            .await
            .domains
            .insert(domain.fqdn.clone(), domain.clone());
        Ok(())
    }

    async fn get_semantic_id(
        &self,
        id: &str,
        owner: &str,
    ) -> StdResult<Option<SemanticId>, StorError> {
        Ok(self
            .tables
            .lock()
            .await
            .semantic_ids
            .get(&(id.to_owned(), owner.to_owned()))
            .cloned())
    }

    async fn upsert_semantic_id(&self, semantic_id: &SemanticId) -> StdResult<(), StorError> {
        self.tables.lock().await.semantic_ids.insert(
            (semantic_id.id.clone(), semantic_id.owner.clone()),
            semantic_id.clone(),
        );
        Ok(())
    }

    async fn ping(&self) -> StdResult<(), StorError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;

    use storage::Backend;

    fn item(tl: &str, res: &str, secs: i64) -> TimelineItem {
        TimelineItem {
            resource_id: res.to_owned(),
            timeline_id: tl.to_owned(),
            owner: "con1owner".to_owned(),
            author: Some("con1author".to_owned()),
            schema: Some("https://schema.example/note".to_owned()),
            cdate: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn items() {
        let backend = MemoryBackend::new();
        assert!(backend.create_item(&item("a", "m1", 1000)).await.unwrap());
        assert!(!backend.create_item(&item("a", "m1", 1000)).await.unwrap());
        assert!(backend.create_item(&item("a", "m2", 1300)).await.unwrap());
        assert!(backend.create_item(&item("a", "m3", 1300)).await.unwrap());
        assert!(backend.create_item(&item("b", "m4", 1900)).await.unwrap());

        let latest = backend
            .latest_item_times(
                &["a".to_owned(), "b".to_owned(), "c".to_owned()],
                &Utc.timestamp_opt(1800, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["a"].timestamp(), 1300);

        let range = backend
            .items_in_range(
                "a",
                &Utc.timestamp_opt(1200, 0).unwrap(),
                &Utc.timestamp_opt(1800, 0).unwrap(),
                100,
            )
            .await
            .unwrap();
        assert_eq!(
            range
                .iter()
                .map(|i| i.resource_id.as_str())
                .collect::<Vec<_>>(),
            vec!["m3", "m2"]
        );

        let after = backend
            .items_after(
                &["a".to_owned(), "b".to_owned()],
                &Utc.timestamp_opt(1000, 0).unwrap(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(
            after
                .iter()
                .map(|i| i.resource_id.as_str())
                .collect::<Vec<_>>(),
            vec!["m2", "m3", "m4"]
        );

        assert!(backend.delete_item("a", "m1").await.unwrap());
        assert!(!backend.delete_item("a", "m1").await.unwrap());
        assert!(backend.get_item("a", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revocation_is_idempotent() {
        let backend = MemoryBackend::new();
        let key = Key {
            id: "cck1xyz".to_owned(),
            root: "con1root".to_owned(),
            parent: "con1root".to_owned(),
            enact_document: "{}".to_owned(),
            enact_signature: "00".to_owned(),
            revoke_document: None,
            revoke_signature: None,
            valid_since: Utc.timestamp_opt(100, 0).unwrap(),
            valid_until: None,
        };
        assert!(backend.enact_key(&key).await.unwrap());
        assert!(!backend.enact_key(&key).await.unwrap());
        let first = backend
            .revoke_key("cck1xyz", "doc1", "sig1", &Utc.timestamp_opt(200, 0).unwrap())
            .await
            .unwrap()
            .unwrap();
        let second = backend
            .revoke_key("cck1xyz", "doc2", "sig2", &Utc.timestamp_opt(300, 0).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.valid_until, second.valid_until);
        assert_eq!(second.revoke_document.as_deref(), Some("doc1"));
        assert!(backend
            .revoke_key("cck1nope", "d", "s", &Utc::now())
            .await
            .unwrap()
            .is_none());
    }
}
