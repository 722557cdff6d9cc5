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

//! # The commit pipeline
//!
//! Every state change a client can make arrives as a signed document submitted to `POST
//! /api/v1/commit`. [CommitPipeline::commit] parses it, checks the signature (following the
//! signer's key chain if need be), checks the signer isn't blocked & then dispatches on the
//! document type.

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use http::StatusCode;
use serde::Serialize;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use concurrent_shared::{
    api::CommitReq,
    documents::{self, resource_cdid, Body, Document},
    entities::{Entity, Event, Key, Timeline, TimelineItem},
};

use crate::{
    counter_add,
    key_chain::{self, KeyChain},
    metrics::{self, Instruments, Sort},
    policy::{EvalResult, PolicyEngine, RequestContext},
    storage::{self, Backend as StorageBackend},
    timeline::{self, TimelineService},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Signature validation failed: {source}"))]
    Authentication {
        #[snafu(source(from(key_chain::Error, Box::new)))]
        source: Box<key_chain::Error>,
        backtrace: Backtrace,
    },
    #[snafu(display("Malformed document: {source}"))]
    BadDocument {
        source: documents::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{signer} may not commit documents here"))]
    Blocked { signer: String, backtrace: Backtrace },
    #[snafu(display("{domain} is not this domain"))]
    ForeignDomain { domain: String, backtrace: Backtrace },
    #[snafu(display("While updating keys: {source}"))]
    Keys {
        #[snafu(source(from(key_chain::Error, Box::new)))]
        source: Box<key_chain::Error>,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Timeline {
        #[snafu(source(from(timeline::Error, Box::new)))]
        source: Box<timeline::Error>,
        backtrace: Backtrace,
    },
    #[snafu(display("Can't delete {target}: unsupported resource type"))]
    UnsupportedTarget { target: String, backtrace: Backtrace },
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadDocument { .. }
            | Error::ForeignDomain { .. }
            | Error::UnsupportedTarget { .. } => StatusCode::BAD_REQUEST,
            Error::Authentication { source, .. } => match source.status() {
                StatusCode::INTERNAL_SERVER_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNAUTHORIZED,
            },
            Error::Blocked { .. } => StatusCode::FORBIDDEN,
            Error::Keys { source, .. } => source.status(),
            Error::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Timeline { source, .. } => source.status(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! { metrics::Registration::new("commit.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("commit.failures", Sort::IntegralCounter) }

/// What a successful commit produced
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum CommitResult {
    Key(Key),
    Timeline(Timeline),
    /// A message or association, with the items posted on its behalf
    Resource {
        id: String,
        items: Vec<TimelineItem>,
    },
    Entity(Entity),
    Deleted {
        deleted: String,
    },
    Retracted {
        timeline: String,
        target: String,
    },
    Event(Event),
}

pub struct CommitPipeline {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    key_chain: Arc<KeyChain>,
    policy: Arc<PolicyEngine>,
    timelines: Arc<TimelineService>,
    instruments: Arc<Instruments>,
    /// Commit logs are written beneath here, when set
    repository_path: Option<PathBuf>,
}

impl CommitPipeline {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        key_chain: Arc<KeyChain>,
        policy: Arc<PolicyEngine>,
        timelines: Arc<TimelineService>,
        instruments: Arc<Instruments>,
        repository_path: Option<PathBuf>,
    ) -> CommitPipeline {
        CommitPipeline {
            storage,
            key_chain,
            policy,
            timelines,
            instruments,
            repository_path,
        }
    }

    /// Commit a signed document
    #[instrument(skip_all)]
    pub async fn commit(&self, req: &CommitReq) -> Result<CommitResult> {
        let res = self.commit1(req).await;
        match &res {
            Ok(_) => {
                counter_add!(self.instruments, "commit.successes", 1, &[]);
            }
            Err(err) => {
                debug!("Commit rejected: {err}");
                counter_add!(self.instruments, "commit.failures", 1, &[]);
            }
        }
        res
    }

    async fn commit1(&self, req: &CommitReq) -> Result<CommitResult> {
        let document = req.document.as_str();
        let signature = req.signature.as_str();
        // Parse up-front, so that garbage is a bad request rather than an authentication failure
        Document::parse(document).context(BadDocumentSnafu)?;
        let doc = self
            .key_chain
            .validate_signed_object(document, signature)
            .await
            .context(AuthenticationSnafu)?;
        if let Some(option) = &req.option {
            debug!("Ignoring the commit option {option}");
        }
        let header = &doc.header;

        let mut ctx = self
            .timelines
            .requester(&header.signer)
            .await
            .context(TimelineSnafu)?;
        ctx.document = serde_json::from_str(document).unwrap_or_default();
        if matches!(
            self.policy.test_with_global(&ctx, "global"),
            EvalResult::Never | EvalResult::Deny
        ) {
            info!(principal = header.signer, "Blocked commit");
            return BlockedSnafu {
                signer: &header.signer,
            }
            .fail();
        }

        let signer = header.signer.clone();
        let (result, owners) = match &doc.body {
            Body::Enact(_) => {
                let key = self
                    .key_chain
                    .enact(document, signature)
                    .await
                    .context(KeysSnafu)?;
                let owner = key.root.clone();
                (CommitResult::Key(key), vec![owner])
            }
            Body::Revoke(_) => {
                let key = self
                    .key_chain
                    .revoke(document, signature)
                    .await
                    .context(KeysSnafu)?;
                let owner = key.root.clone();
                (CommitResult::Key(key), vec![owner])
            }
            Body::Timeline(_) => {
                let timeline = self
                    .timelines
                    .upsert_timeline(&doc, document, signature, ctx)
                    .await
                    .context(TimelineSnafu)?;
                let owner = if timeline.domain_owned {
                    self.timelines.fqdn().to_owned()
                } else {
                    timeline.author.clone()
                };
                (CommitResult::Timeline(timeline), vec![owner])
            }
            Body::Delete(body) => {
                if !body.target.starts_with('t') {
                    return UnsupportedTargetSnafu {
                        target: &body.target,
                    }
                    .fail();
                }
                self.timelines
                    .delete_timeline(&body.target, document, ctx)
                    .await
                    .context(TimelineSnafu)?;
                (
                    CommitResult::Deleted {
                        deleted: body.target.clone(),
                    },
                    vec![signer],
                )
            }
            Body::Message(body) => {
                let result = self
                    .post_resource(&doc, 'm', &body.timelines, document, signature)
                    .await?;
                (result, vec![signer])
            }
            Body::Association(body) => {
                let result = self
                    .post_resource(&doc, 'a', &body.timelines, document, signature)
                    .await?;
                (result, vec![signer])
            }
            Body::Retract(body) => {
                self.timelines
                    .retract(&body.timeline, &body.target, document, signature, ctx)
                    .await
                    .context(TimelineSnafu)?;
                (
                    CommitResult::Retracted {
                        timeline: body.timeline.clone(),
                        target: body.target.clone(),
                    },
                    vec![signer],
                )
            }
            Body::Event(body) => {
                let event = self
                    .timelines
                    .distribute_event(body, ctx)
                    .await
                    .context(TimelineSnafu)?;
                (CommitResult::Event(event), Vec::new())
            }
            Body::Affiliation(body) => {
                let entity = self.affiliate(&signer, &body.domain).await?;
                (CommitResult::Entity(entity), vec![signer])
            }
            Body::Tombstone => {
                let entity = self.tombstone(&signer, document, ctx).await?;
                (CommitResult::Entity(entity), vec![signer])
            }
        };

        self.log_commit(&owners, document, signature).await;
        Ok(result)
    }

    /// Post the message or association `doc` into each of `timelines`
    ///
    /// The resource id is derived from the document, so re-submitting it is harmless.
    async fn post_resource(
        &self,
        doc: &Document,
        prefix: char,
        timelines: &[String],
        document: &str,
        signature: &str,
    ) -> Result<CommitResult> {
        let header = &doc.header;
        let id = resource_cdid(document, &header.signed_at).with_prefix(prefix);
        let mut items = Vec::with_capacity(timelines.len());
        for timeline in timelines {
            let item = TimelineItem {
                resource_id: id.clone(),
                timeline_id: timeline.clone(),
                owner: header.owner().to_owned(),
                author: Some(header.signer.clone()),
                schema: header.schema.clone(),
                cdate: header.signed_at,
            };
            let ctx = self
                .timelines
                .requester(&header.signer)
                .await
                .context(TimelineSnafu)?;
            items.push(
                self.timelines
                    .post_item(timeline, item, document, signature, ctx)
                    .await
                    .context(TimelineSnafu)?,
            );
        }
        Ok(CommitResult::Resource { id, items })
    }

    /// Record that `signer` lives here, keeping whatever tags it already has
    ///
    /// Only affiliations naming this domain are accepted.
    async fn affiliate(&self, signer: &str, domain: &str) -> Result<Entity> {
        if domain != self.timelines.fqdn() {
            return ForeignDomainSnafu { domain }.fail();
        }
        let existing = self.storage.get_entity(signer).await.context(StorageSnafu)?;
        let entity = Entity {
            ccid: signer.to_owned(),
            domain: domain.to_owned(),
            tag: existing
                .as_ref()
                .map(|entity| entity.tag.clone())
                .unwrap_or_default(),
            alias: existing.as_ref().and_then(|entity| entity.alias.clone()),
            cdate: existing.map(|entity| entity.cdate).unwrap_or_else(Utc::now),
        };
        self.storage
            .upsert_entity(&entity)
            .await
            .context(StorageSnafu)?;
        info!("{signer} is now homed on {domain}");
        Ok(entity)
    }

    /// `signer` is leaving for good: remove their timelines & mark the account
    async fn tombstone(
        &self,
        signer: &str,
        document: &str,
        ctx: RequestContext,
    ) -> Result<Entity> {
        for timeline in self
            .timelines
            .list_timelines_by_author(signer)
            .await
            .context(TimelineSnafu)?
        {
            if let Err(err) = self
                .timelines
                .delete_timeline(&timeline.id, document, ctx.clone())
                .await
            {
                warn!("Failed to remove {} for {signer}: {err}", timeline.id);
            }
        }
        let mut entity = match self.storage.get_entity(signer).await.context(StorageSnafu)? {
            Some(entity) => entity,
            None => Entity {
                ccid: signer.to_owned(),
                domain: self.timelines.fqdn().to_owned(),
                tag: String::new(),
                alias: None,
                cdate: Utc::now(),
            },
        };
        if !entity.has_tag("_tombstone") {
            entity.tag = if entity.tag.is_empty() {
                "_tombstone".to_owned()
            } else {
                format!("{},_tombstone", entity.tag)
            };
        }
        self.storage
            .upsert_entity(&entity)
            .await
            .context(StorageSnafu)?;
        info!("Tombstoned {signer}");
        Ok(entity)
    }

    /// Append this commit to the log of each local owner; failures are logged & otherwise ignored
    async fn log_commit(&self, owners: &[String], document: &str, signature: &str) {
        let Some(root) = &self.repository_path else {
            return;
        };
        let dir = root.join("user");
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!("Failed to create {}: {err}", dir.display());
            return;
        }
        for owner in owners {
            if owner != self.timelines.fqdn() {
                match self.storage.get_entity(owner).await {
                    Ok(Some(entity)) if entity.domain != self.timelines.fqdn() => continue,
                    Ok(_) => (),
                    Err(err) => {
                        warn!("Failed to look up {owner}: {err}");
                        continue;
                    }
                }
            }
            let path = dir.join(format!("{owner}.log"));
            let line = format!("{signature} {document}\n");
            let res = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(mut file) => file.write_all(line.as_bytes()).await,
                Err(err) => Err(err),
            };
            if let Err(err) = res {
                warn!("Failed to append to {}: {err}", path.display());
            }
        }
    }
}
