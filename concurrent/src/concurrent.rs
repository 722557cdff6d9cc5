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

//! # The concurrent node
//!
//! [Concurrent] is the application state handed to every handler. [Node] assembles it from
//! configuration: it selects the storage & cache backends, wires the services together & starts
//! the realtime keeper.

use std::{
    collections::HashSet,
    sync::{atomic::AtomicU64, Arc},
};

use chrono::Utc;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use concurrent_shared::{
    crypto::{self, derive_address, public_key_hex, Scheme},
    entities::Domain,
};

use crate::{
    cache::{Cache, MemoryCache},
    chunk_store::ChunkStore,
    client::{self, make_client},
    commit::CommitPipeline,
    config::{CacheConfig, ConfigV1, StorageConfig},
    keeper::{Keeper, KeeperHandle},
    key_chain::KeyChain,
    memory::MemoryBackend,
    metrics::Instruments,
    peer::Peers,
    policy::{self, Policy, PolicyEngine, DEFAULT_GLOBAL_POLICY},
    postgres,
    pubsub::{Bus, LocalBus},
    redis_store::{self, RedisBus, RedisCache},
    storage::Backend as StorageBackend,
    timeline::TimelineService,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    Client { source: client::Error },
    #[snafu(display("Failed to read the global policy at {}: {source}", pth.display()))]
    GlobalPolicy {
        pth: std::path::PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse the global policy: {source}"))]
    ParsePolicy { source: policy::Error },
    #[snafu(display("Failed to connect to Postgres: {source}"))]
    Postgres { source: postgres::Error },
    #[snafu(display("The configured private key is unusable: {source}"))]
    PrivateKey {
        source: crypto::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to redis: {source}"))]
    Redis { source: redis_store::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Application state available to all handlers
pub struct Concurrent {
    pub fqdn: String,
    /// This node, as described to its peers
    pub domain: Domain,
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub cache: Arc<dyn Cache + Send + Sync>,
    pub bus: Arc<dyn Bus + Send + Sync>,
    pub key_chain: Arc<KeyChain>,
    pub timelines: Arc<TimelineService>,
    pub commit: CommitPipeline,
    pub keeper: KeeperHandle,
    pub instruments: Arc<Instruments>,
    pub exporter: PrometheusExporter,
    /// Source of realtime connection ids
    pub connections: AtomicU64,
}

async fn select_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend + Send + Sync>> {
    Ok(match config {
        StorageConfig::Memory => Arc::new(MemoryBackend::new()),
        StorageConfig::Postgres {
            dsn,
            max_connections,
        } => Arc::new(
            postgres::Session::new(dsn, *max_connections)
                .await
                .context(PostgresSnafu)?,
        ),
    })
}

async fn select_cache(
    config: &CacheConfig,
) -> Result<(Arc<dyn Cache + Send + Sync>, Arc<dyn Bus + Send + Sync>)> {
    Ok(match config {
        CacheConfig::Memory => (Arc::new(MemoryCache::new()), Arc::new(LocalBus::new())),
        CacheConfig::Redis { url } => (
            Arc::new(RedisCache::new(url).await.context(RedisSnafu)?),
            Arc::new(RedisBus::new(url).await.context(RedisSnafu)?),
        ),
    })
}

fn global_policy(cfg: &ConfigV1) -> Result<Policy> {
    match &cfg.global_policy {
        Some(pth) => std::fs::read_to_string(pth)
            .context(GlobalPolicySnafu { pth })?
            .parse::<Policy>()
            .context(ParsePolicySnafu),
        None => DEFAULT_GLOBAL_POLICY
            .parse::<Policy>()
            .context(ParsePolicySnafu),
    }
}

/// A running node: its state, plus the background tasks serving it
pub struct Node {
    state: Arc<Concurrent>,
    shutdown: CancellationToken,
    keeper: JoinHandle<()>,
}

impl Node {
    /// Assemble a node from `cfg` & start its keeper
    pub async fn new(cfg: &ConfigV1, exporter: PrometheusExporter) -> Result<Node> {
        let ccid = match &cfg.ccid {
            Some(ccid) => ccid.clone(),
            None => derive_address(&cfg.private_key, Scheme::Bech32("con"))
                .context(PrivateKeySnafu)?,
        };
        let csid = match &cfg.csid {
            Some(csid) => csid.clone(),
            None => derive_address(&cfg.private_key, Scheme::Bech32("ccs"))
                .context(PrivateKeySnafu)?,
        };
        let pubkey = public_key_hex(&cfg.private_key).context(PrivateKeySnafu)?;

        let instruments = Arc::new(Instruments::new("concurrent"));
        let storage = select_storage(&cfg.storage_config).await?;
        let (cache, bus) = select_cache(&cfg.cache_config).await?;
        let client = make_client(&cfg.user_agent, instruments.clone()).context(ClientSnafu)?;
        let peers = Arc::new(Peers::new(
            client,
            storage.clone(),
            &cfg.dimension,
            cfg.peer_origins.clone(),
        ));

        let (subs_tx, subs_rx) = watch::channel(HashSet::new());
        let chunks = Arc::new(ChunkStore::new(
            storage.clone(),
            cache.clone(),
            peers.clone(),
            &cfg.fqdn,
            subs_rx,
            instruments.clone(),
        ));
        let policy = Arc::new(PolicyEngine::new(
            global_policy(cfg)?,
            &cfg.fqdn,
            &csid,
            cache.clone(),
            peers.clone(),
        ));
        let key_chain = Arc::new(KeyChain::new(
            storage.clone(),
            cache.clone(),
            peers.clone(),
            &cfg.fqdn,
        ));
        let timelines = Arc::new(
            TimelineService::new(
                storage.clone(),
                cache.clone(),
                bus.clone(),
                chunks.clone(),
                peers.clone(),
                policy.clone(),
                key_chain.clone(),
                &cfg.fqdn,
            )
            .with_admins(cfg.admins.iter().cloned()),
        );
        let commit = CommitPipeline::new(
            storage.clone(),
            key_chain.clone(),
            policy,
            timelines.clone(),
            instruments.clone(),
            cfg.repository_path.clone(),
        );

        let shutdown = CancellationToken::new();
        let (keeper, handle) = Keeper::new(
            &cfg.fqdn,
            peers,
            chunks,
            bus.clone(),
            subs_tx,
            instruments.clone(),
            shutdown.clone(),
        );
        let keeper = tokio::spawn(keeper.run());

        let now = Utc::now();
        let state = Arc::new(Concurrent {
            fqdn: cfg.fqdn.clone(),
            domain: Domain {
                fqdn: cfg.fqdn.clone(),
                ccid,
                csid,
                tag: String::new(),
                dimension: cfg.dimension.clone(),
                pubkey: Some(pubkey),
                cdate: now,
                mdate: now,
                last_scraped: None,
            },
            storage,
            cache,
            bus,
            key_chain,
            timelines,
            commit,
            keeper: handle,
            instruments,
            exporter,
            connections: AtomicU64::new(0),
        });
        info!("Node {} ({}) assembled", cfg.fqdn, state.domain.ccid);
        Ok(Node {
            state,
            shutdown,
            keeper,
        })
    }

    pub fn state(&self) -> Arc<Concurrent> {
        self.state.clone()
    }

    /// Stop the keeper (and with it every peer connection)
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.keeper.await {
            warn!("The keeper exited abnormally: {err}");
        }
    }
}
