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

//! [Storage] implementation for PostgreSQL
//!
//! [Storage]: crate::storage

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{Backtrace, ResultExt, Snafu};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tap::Pipe;

use concurrent_shared::entities::{Domain, Entity, Key, SemanticId, Timeline, TimelineItem};

use crate::storage::{self, Error as StorError, ItemQuery};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to {dsn}: {source}"))]
    Connect {
        dsn: String,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create the schema ({stmt}): {source}"))]
    Schema {
        stmt: &'static str,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

impl std::convert::From<sqlx::Error> for StorError {
    fn from(value: sqlx::Error) -> Self {
        StorError::new(value)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Schema                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

const SCHEMA: [&str; 8] = [
    "CREATE TABLE IF NOT EXISTS timelines (
        id TEXT PRIMARY KEY,
        indexable BOOLEAN NOT NULL,
        owner TEXT NOT NULL,
        author TEXT NOT NULL,
        schema TEXT NOT NULL,
        policy TEXT,
        policy_params TEXT,
        policy_defaults TEXT,
        document TEXT NOT NULL,
        signature TEXT NOT NULL,
        domain_owned BOOLEAN NOT NULL,
        c_date TIMESTAMPTZ NOT NULL,
        m_date TIMESTAMPTZ NOT NULL)",
    "CREATE TABLE IF NOT EXISTS timeline_items (
        resource_id TEXT NOT NULL,
        timeline_id TEXT NOT NULL,
        owner TEXT NOT NULL,
        author TEXT,
        schema TEXT,
        c_date TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (timeline_id, resource_id))",
    "CREATE INDEX IF NOT EXISTS timeline_items_by_date ON timeline_items (timeline_id, c_date)",
    "CREATE TABLE IF NOT EXISTS keys (
        id TEXT PRIMARY KEY,
        root TEXT NOT NULL,
        parent TEXT NOT NULL,
        enact_document TEXT NOT NULL,
        enact_signature TEXT NOT NULL,
        revoke_document TEXT,
        revoke_signature TEXT,
        valid_since TIMESTAMPTZ NOT NULL,
        valid_until TIMESTAMPTZ)",
    "CREATE TABLE IF NOT EXISTS entities (
        ccid TEXT PRIMARY KEY,
        domain TEXT NOT NULL,
        tag TEXT NOT NULL,
        alias TEXT,
        c_date TIMESTAMPTZ NOT NULL)",
    "CREATE TABLE IF NOT EXISTS domains (
        fqdn TEXT PRIMARY KEY,
        ccid TEXT NOT NULL,
        csid TEXT NOT NULL,
        tag TEXT NOT NULL,
        dimension TEXT NOT NULL,
        pubkey TEXT,
        c_date TIMESTAMPTZ NOT NULL,
        m_date TIMESTAMPTZ NOT NULL,
        last_scraped TIMESTAMPTZ)",
    "CREATE TABLE IF NOT EXISTS semantic_ids (
        id TEXT NOT NULL,
        owner TEXT NOT NULL,
        target TEXT NOT NULL,
        document TEXT NOT NULL,
        signature TEXT NOT NULL,
        c_date TIMESTAMPTZ NOT NULL,
        m_date TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (id, owner))",
    "CREATE INDEX IF NOT EXISTS timelines_by_author ON timelines (author)",
];

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Rows                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(sqlx::FromRow)]
struct ItemRow {
    resource_id: String,
    timeline_id: String,
    owner: String,
    author: Option<String>,
    schema: Option<String>,
    c_date: DateTime<Utc>,
}

impl From<ItemRow> for TimelineItem {
    fn from(row: ItemRow) -> Self {
        TimelineItem {
            resource_id: row.resource_id,
            timeline_id: row.timeline_id,
            owner: row.owner,
            author: row.author,
            schema: row.schema,
            cdate: row.c_date,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TimelineRow {
    id: String,
    indexable: bool,
    owner: String,
    author: String,
    schema: String,
    policy: Option<String>,
    policy_params: Option<String>,
    policy_defaults: Option<String>,
    document: String,
    signature: String,
    domain_owned: bool,
    c_date: DateTime<Utc>,
    m_date: DateTime<Utc>,
}

impl From<TimelineRow> for Timeline {
    fn from(row: TimelineRow) -> Self {
        Timeline {
            id: row.id,
            indexable: row.indexable,
            owner: row.owner,
            author: row.author,
            schema: row.schema,
            policy: row.policy,
            policy_params: row.policy_params,
            policy_defaults: row.policy_defaults,
            document: row.document,
            signature: row.signature,
            cdate: row.c_date,
            mdate: row.m_date,
            domain_owned: row.domain_owned,
        }
    }
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    id: String,
    root: String,
    parent: String,
    enact_document: String,
    enact_signature: String,
    revoke_document: Option<String>,
    revoke_signature: Option<String>,
    valid_since: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
}

impl From<KeyRow> for Key {
    fn from(row: KeyRow) -> Self {
        Key {
            id: row.id,
            root: row.root,
            parent: row.parent,
            enact_document: row.enact_document,
            enact_signature: row.enact_signature,
            revoke_document: row.revoke_document,
            revoke_signature: row.revoke_signature,
            valid_since: row.valid_since,
            valid_until: row.valid_until,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    ccid: String,
    domain: String,
    tag: String,
    alias: Option<String>,
    c_date: DateTime<Utc>,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Entity {
            ccid: row.ccid,
            domain: row.domain,
            tag: row.tag,
            alias: row.alias,
            cdate: row.c_date,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DomainRow {
    fqdn: String,
    ccid: String,
    csid: String,
    tag: String,
    dimension: String,
    pubkey: Option<String>,
    c_date: DateTime<Utc>,
    m_date: DateTime<Utc>,
    last_scraped: Option<DateTime<Utc>>,
}

impl From<DomainRow> for Domain {
    fn from(row: DomainRow) -> Self {
        Domain {
            fqdn: row.fqdn,
            ccid: row.ccid,
            csid: row.csid,
            tag: row.tag,
            dimension: row.dimension,
            pubkey: row.pubkey,
            cdate: row.c_date,
            mdate: row.m_date,
            last_scraped: row.last_scraped,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SemanticIdRow {
    id: String,
    owner: String,
    target: String,
    document: String,
    signature: String,
    c_date: DateTime<Utc>,
    m_date: DateTime<Utc>,
}

impl From<SemanticIdRow> for SemanticId {
    fn from(row: SemanticIdRow) -> Self {
        SemanticId {
            id: row.id,
            owner: row.owner,
            target: row.target,
            document: row.document,
            signature: row.signature,
            cdate: row.c_date,
            mdate: row.m_date,
        }
    }
}

const ITEM_COLUMNS: &str = "resource_id, timeline_id, owner, author, schema, c_date";
const TIMELINE_COLUMNS: &str = "id, indexable, owner, author, schema, policy, policy_params, \
     policy_defaults, document, signature, domain_owned, c_date, m_date";
const KEY_COLUMNS: &str = "id, root, parent, enact_document, enact_signature, revoke_document, \
     revoke_signature, valid_since, valid_until";

// Postgres wants a signed count
fn as_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Session                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `concurrent`-specific Postgres session; a thin wrapper around a connection pool
pub struct Session {
    pool: PgPool,
}

impl Session {
    /// Connect to the database at `dsn` & make sure the tables exist
    pub async fn new(dsn: &str, max_connections: u32) -> Result<Session> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .context(ConnectSnafu {
                dsn: dsn.to_owned(),
            })?;
        let session = Session { pool };
        session.ensure_schema().await?;
        Ok(session)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context(SchemaSnafu { stmt })?;
        }
        Ok(())
    }
}

#[async_trait]
impl storage::Backend for Session {
    async fn create_item(&self, item: &TimelineItem) -> StdResult<bool, StorError> {
        sqlx::query(
            "INSERT INTO timeline_items (resource_id, timeline_id, owner, author, schema, c_date) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        )
        .bind(&item.resource_id)
        .bind(&item.timeline_id)
        .bind(&item.owner)
        .bind(&item.author)
        .bind(&item.schema)
        .bind(item.cdate)
        .execute(&self.pool)
        .await?
        .rows_affected()
        .pipe(|n| Ok(n != 0))
    }

    async fn get_item(
        &self,
        timeline: &str,
        resource: &str,
    ) -> StdResult<Option<TimelineItem>, StorError> {
        sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM timeline_items WHERE timeline_id = $1 AND resource_id = $2"
        ))
        .bind(timeline)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?
        .map(TimelineItem::from)
        .pipe(Ok)
    }

    async fn delete_item(&self, timeline: &str, resource: &str) -> StdResult<bool, StorError> {
        sqlx::query("DELETE FROM timeline_items WHERE timeline_id = $1 AND resource_id = $2")
            .bind(timeline)
            .bind(resource)
            .execute(&self.pool)
            .await?
            .rows_affected()
            .pipe(|n| Ok(n != 0))
    }

    async fn latest_item_times(
        &self,
        timelines: &[String],
        before: &DateTime<Utc>,
    ) -> StdResult<HashMap<String, DateTime<Utc>>, StorError> {
        if timelines.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT timeline_id, MAX(c_date) FROM timeline_items \
             WHERE timeline_id = ANY($1) AND c_date < $2 GROUP BY timeline_id",
        )
        .bind(timelines)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn items_in_range(
        &self,
        timeline: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        limit: usize,
    ) -> StdResult<Vec<TimelineItem>, StorError> {
        sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM timeline_items \
             WHERE timeline_id = $1 AND c_date >= $2 AND c_date < $3 \
             ORDER BY c_date DESC, resource_id DESC LIMIT $4"
        ))
        .bind(timeline)
        .bind(start)
        .bind(end)
        .bind(as_limit(limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TimelineItem::from)
        .collect::<Vec<_>>()
        .pipe(Ok)
    }

    async fn items_after(
        &self,
        timelines: &[String],
        since: &DateTime<Utc>,
        limit: usize,
    ) -> StdResult<Vec<TimelineItem>, StorError> {
        if timelines.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM timeline_items \
             WHERE timeline_id = ANY($1) AND c_date > $2 \
             ORDER BY c_date ASC, resource_id ASC LIMIT $3"
        ))
        .bind(timelines)
        .bind(since)
        .bind(as_limit(limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TimelineItem::from)
        .collect::<Vec<_>>()
        .pipe(Ok)
    }

    async fn query_items(
        &self,
        timeline: &str,
        query: &ItemQuery,
    ) -> StdResult<Vec<TimelineItem>, StorError> {
        // NULL parameters disable their filter
        sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM timeline_items \
             WHERE timeline_id = $1 \
             AND ($2::TEXT IS NULL OR schema = $2) \
             AND ($3::TEXT IS NULL OR owner = $3) \
             AND ($4::TEXT IS NULL OR author = $4) \
             AND ($5::TIMESTAMPTZ IS NULL OR c_date < $5) \
             ORDER BY c_date DESC, resource_id DESC LIMIT $6"
        ))
        .bind(timeline)
        .bind(&query.schema)
        .bind(&query.owner)
        .bind(&query.author)
        .bind(query.until)
        .bind(as_limit(query.limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TimelineItem::from)
        .collect::<Vec<_>>()
        .pipe(Ok)
    }

    async fn upsert_timeline(&self, timeline: &Timeline) -> StdResult<Timeline, StorError> {
        sqlx::query_as::<_, TimelineRow>(&format!(
            "INSERT INTO timelines ({TIMELINE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO UPDATE SET indexable = EXCLUDED.indexable, \
             owner = EXCLUDED.owner, author = EXCLUDED.author, schema = EXCLUDED.schema, \
             policy = EXCLUDED.policy, policy_params = EXCLUDED.policy_params, \
             policy_defaults = EXCLUDED.policy_defaults, document = EXCLUDED.document, \
             signature = EXCLUDED.signature, domain_owned = EXCLUDED.domain_owned, \
             m_date = EXCLUDED.m_date \
             RETURNING {TIMELINE_COLUMNS}"
        ))
        .bind(&timeline.id)
        .bind(timeline.indexable)
        .bind(&timeline.owner)
        .bind(&timeline.author)
        .bind(&timeline.schema)
        .bind(&timeline.policy)
        .bind(&timeline.policy_params)
        .bind(&timeline.policy_defaults)
        .bind(&timeline.document)
        .bind(&timeline.signature)
        .bind(timeline.domain_owned)
        .bind(timeline.cdate)
        .bind(timeline.mdate)
        .fetch_one(&self.pool)
        .await?
        .pipe(|row| Ok(row.into()))
    }

    async fn get_timeline(&self, id: &str) -> StdResult<Option<Timeline>, StorError> {
        sqlx::query_as::<_, TimelineRow>(&format!(
            "SELECT {TIMELINE_COLUMNS} FROM timelines WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Timeline::from)
        .pipe(Ok)
    }

    async fn delete_timeline(&self, id: &str) -> StdResult<bool, StorError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM timeline_items WHERE timeline_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM timelines WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted != 0)
    }

    async fn timelines_by_schema(&self, schema: &str) -> StdResult<Vec<Timeline>, StorError> {
        sqlx::query_as::<_, TimelineRow>(&format!(
            "SELECT {TIMELINE_COLUMNS} FROM timelines WHERE schema = $1 AND indexable"
        ))
        .bind(schema)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Timeline::from)
        .collect::<Vec<_>>()
        .pipe(Ok)
    }

    async fn timelines_by_author(&self, author: &str) -> StdResult<Vec<Timeline>, StorError> {
        sqlx::query_as::<_, TimelineRow>(&format!(
            "SELECT {TIMELINE_COLUMNS} FROM timelines WHERE author = $1"
        ))
        .bind(author)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Timeline::from)
        .collect::<Vec<_>>()
        .pipe(Ok)
    }

    async fn enact_key(&self, key: &Key) -> StdResult<bool, StorError> {
        sqlx::query(&format!(
            "INSERT INTO keys ({KEY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT DO NOTHING"
        ))
        .bind(&key.id)
        .bind(&key.root)
        .bind(&key.parent)
        .bind(&key.enact_document)
        .bind(&key.enact_signature)
        .bind(&key.revoke_document)
        .bind(&key.revoke_signature)
        .bind(key.valid_since)
        .bind(key.valid_until)
        .execute(&self.pool)
        .await?
        .rows_affected()
        .pipe(|n| Ok(n != 0))
    }

    async fn get_key(&self, id: &str) -> StdResult<Option<Key>, StorError> {
        sqlx::query_as::<_, KeyRow>(&format!("SELECT {KEY_COLUMNS} FROM keys WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Key::from)
            .pipe(Ok)
    }

    async fn revoke_key(
        &self,
        id: &str,
        document: &str,
        signature: &str,
        at: &DateTime<Utc>,
    ) -> StdResult<Option<Key>, StorError> {
        // The first revocation wins; later ones leave the row alone
        sqlx::query(
            "UPDATE keys SET revoke_document = $2, revoke_signature = $3, valid_until = $4 \
             WHERE id = $1 AND revoke_document IS NULL",
        )
        .bind(id)
        .bind(document)
        .bind(signature)
        .bind(at)
        .execute(&self.pool)
        .await?;
        self.get_key(id).await
    }

    async fn get_entity(&self, ccid: &str) -> StdResult<Option<Entity>, StorError> {
        sqlx::query_as::<_, EntityRow>(
            "SELECT ccid, domain, tag, alias, c_date FROM entities WHERE ccid = $1",
        )
        .bind(ccid)
        .fetch_optional(&self.pool)
        .await?
        .map(Entity::from)
        .pipe(Ok)
    }

    async fn upsert_entity(&self, entity: &Entity) -> StdResult<(), StorError> {
        sqlx::query(
            "INSERT INTO entities (ccid, domain, tag, alias, c_date) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (ccid) DO UPDATE SET domain = EXCLUDED.domain, tag = EXCLUDED.tag, \
             alias = EXCLUDED.alias",
        )
        .bind(&entity.ccid)
        .bind(&entity.domain)
        .bind(&entity.tag)
        .bind(&entity.alias)
        .bind(entity.cdate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_domain(&self, fqdn: &str) -> StdResult<Option<Domain>, StorError> {
        sqlx::query_as::<_, DomainRow>(
            "SELECT fqdn, ccid, csid, tag, dimension, pubkey, c_date, m_date, last_scraped \
             FROM domains WHERE fqdn = $1",
        )
        .bind(fqdn)
        .fetch_optional(&self.pool)
        .await?
        .map(Domain::from)
        .pipe(Ok)
    }

    async fn upsert_domain(&self, domain: &Domain) -> StdResult<(), StorError> {
        sqlx::query(
            "INSERT INTO domains (fqdn, ccid, csid, tag, dimension, pubkey, c_date, m_date, \
             last_scraped) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (fqdn) DO UPDATE SET ccid = EXCLUDED.ccid, csid = EXCLUDED.csid, \
             tag = EXCLUDED.tag, dimension = EXCLUDED.dimension, pubkey = EXCLUDED.pubkey, \
             m_date = EXCLUDED.m_date, last_scraped = EXCLUDED.last_scraped",
        )
        .bind(&domain.fqdn)
        .bind(&domain.ccid)
        .bind(&domain.csid)
        .bind(&domain.tag)
        .bind(&domain.dimension)
        .bind(&domain.pubkey)
        .bind(domain.cdate)
        .bind(domain.mdate)
        .bind(domain.last_scraped)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_semantic_id(
        &self,
        id: &str,
        owner: &str,
    ) -> StdResult<Option<SemanticId>, StorError> {
        sqlx::query_as::<_, SemanticIdRow>(
            "SELECT id, owner, target, document, signature, c_date, m_date FROM semantic_ids \
             WHERE id = $1 AND owner = $2",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .map(SemanticId::from)
        .pipe(Ok)
    }

    async fn upsert_semantic_id(&self, semantic_id: &SemanticId) -> StdResult<(), StorError> {
        sqlx::query(
            "INSERT INTO semantic_ids (id, owner, target, document, signature, c_date, m_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id, owner) DO UPDATE SET target = EXCLUDED.target, \
             document = EXCLUDED.document, signature = EXCLUDED.signature, \
             m_date = EXCLUDED.m_date",
        )
        .bind(&semantic_id.id)
        .bind(&semantic_id.owner)
        .bind(&semantic_id.target)
        .bind(&semantic_id.document)
        .bind(&semantic_id.signature)
        .bind(semantic_id.cdate)
        .bind(semantic_id.mdate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> StdResult<(), StorError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
