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

//! # The concurrent HTTP API
//!
//! Everything under `/api/v1`, plus the node's operational endpoints (`/health` & `/metrics`).
//! Successful responses are wrapped in the `{"status":"ok","content":…}` envelope; failures are
//! `{"error": <kind>, "message": <detail>}` with the appropriate status code.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeZone, Utc};
use snafu::{Backtrace, IntoError, Snafu};
use tap::Pipe;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, warn};

use concurrent_shared::{
    api::{
        split_csv, BySchemaReq, ByAuthorReq, CheckpointReq, ChunkBodyReq, ChunkItrReq, ChunksReq,
        CommitReq, QueryReq, RangeReq, RecentReq, RetractedReq,
    },
    entities::TimelineItem,
    epoch::Epoch,
};

use crate::{
    commit,
    concurrent::Concurrent,
    counter_add,
    http::{error_response, kind_for_status, ok},
    key_chain,
    metrics::{self, Sort},
    realtime::realtime,
    storage::ItemQuery,
    timeline,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{message}"))]
    BadRequest {
        message: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Commit {
        #[snafu(source(from(commit::Error, Box::new)))]
        source: Box<commit::Error>,
    },
    #[snafu(display("{source}"))]
    KeyChain {
        #[snafu(source(from(key_chain::Error, Box::new)))]
        source: Box<key_chain::Error>,
    },
    #[snafu(display("{source}"))]
    Timeline {
        #[snafu(source(from(timeline::Error, Box::new)))]
        source: Box<timeline::Error>,
    },
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        let status = match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Commit { source } => source.status(),
            Error::KeyChain { source } => match source.status() {
                StatusCode::UNAUTHORIZED => StatusCode::NOT_FOUND,
                status => status,
            },
            Error::Timeline { source } => source.status(),
        };
        (status, format!("{self}"))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (status, msg) = self.as_status_and_msg();
        if status.is_server_error() {
            error!("{msg}");
        } else {
            debug!("{msg}");
        }
        error_response(status, kind_for_status(status), msg)
    }
}

/// Reads return this many items unless told otherwise...
pub const DEFAULT_LIMIT: usize = 16;
/// ...and never more than this many
pub const MAX_LIMIT: usize = 100;
/// The health check gives its probes this long
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

inventory::submit! { metrics::Registration::new("api.commits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("api.reads", Sort::IntegralCounter) }

fn limit_of(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn time_of(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
        BadRequestSnafu {
            message: format!("{secs} is not a legal time"),
        }
        .build()
    })
}

fn rejected<E: std::fmt::Display>(rejection: E) -> Error {
    BadRequestSnafu {
        message: rejection.to_string(),
    }
    .build()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Commit a signed document
async fn commit(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Json<CommitReq>, JsonRejection>,
) -> axum::response::Response {
    async fn commit1(
        state: &Concurrent,
        req: std::result::Result<Json<CommitReq>, JsonRejection>,
    ) -> Result<commit::CommitResult> {
        let Json(req) = req.map_err(rejected)?;
        state
            .commit
            .commit(&req)
            .await
            .map_err(|err| CommitSnafu.into_error(err))
    }

    counter_add!(state.instruments, "api.commits", 1, &[]);
    match commit1(&state, req).await {
        Ok(result) => ok(result),
        Err(err) => err.into_response(),
    }
}

/// Metadata for a single timeline, local or remote
async fn get_timeline(
    State(state): State<Arc<Concurrent>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match state.timelines.get_timeline(&id).await {
        Ok(timeline) => ok(timeline),
        Err(err) => TimelineSnafu.into_error(err).into_response(),
    }
}

/// Timelines with the given schema
async fn by_schema(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<BySchemaReq>, QueryRejection>,
) -> axum::response::Response {
    async fn by_schema1(
        state: &Concurrent,
        req: std::result::Result<Query<BySchemaReq>, QueryRejection>,
    ) -> Result<Vec<concurrent_shared::entities::Timeline>> {
        let Query(req) = req.map_err(rejected)?;
        state
            .timelines
            .list_timelines_by_schema(&req.schema)
            .await
            .map_err(|err| TimelineSnafu.into_error(err))
    }
    match by_schema1(&state, req).await {
        Ok(timelines) => ok(timelines),
        Err(err) => err.into_response(),
    }
}

/// Timelines written by the given author
async fn by_author(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<ByAuthorReq>, QueryRejection>,
) -> axum::response::Response {
    async fn by_author1(
        state: &Concurrent,
        req: std::result::Result<Query<ByAuthorReq>, QueryRejection>,
    ) -> Result<Vec<concurrent_shared::entities::Timeline>> {
        let Query(req) = req.map_err(rejected)?;
        state
            .timelines
            .list_timelines_by_author(&req.author)
            .await
            .map_err(|err| TimelineSnafu.into_error(err))
    }
    match by_author1(&state, req).await {
        Ok(timelines) => ok(timelines),
        Err(err) => err.into_response(),
    }
}

/// The newest items across a set of timelines
async fn recent(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<RecentReq>, QueryRejection>,
) -> axum::response::Response {
    async fn recent1(
        state: &Concurrent,
        req: std::result::Result<Query<RecentReq>, QueryRejection>,
    ) -> Result<Vec<TimelineItem>> {
        let Query(req) = req.map_err(rejected)?;
        let until = match req.until {
            Some(secs) => time_of(secs)?,
            None => Utc::now(),
        };
        state
            .timelines
            .get_recent_items(&split_csv(&req.timelines), until, limit_of(req.limit))
            .await
            .map_err(|err| TimelineSnafu.into_error(err))
    }
    counter_add!(state.instruments, "api.reads", 1, &[]);
    match recent1(&state, req).await {
        Ok(items) => ok(items),
        Err(err) => err.into_response(),
    }
}

/// Items newer than `since`, oldest first
async fn range(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<RangeReq>, QueryRejection>,
) -> axum::response::Response {
    async fn range1(
        state: &Concurrent,
        req: std::result::Result<Query<RangeReq>, QueryRejection>,
    ) -> Result<Vec<TimelineItem>> {
        let Query(req) = req.map_err(rejected)?;
        let since = time_of(req.since.unwrap_or(0))?;
        let until = req.until.map(time_of).transpose()?;
        state
            .timelines
            .get_immediate_items(&split_csv(&req.timelines), since, until, limit_of(req.limit))
            .await
            .map_err(|err| TimelineSnafu.into_error(err))
    }
    counter_add!(state.instruments, "api.reads", 1, &[]);
    match range1(&state, req).await {
        Ok(items) => ok(items),
        Err(err) => err.into_response(),
    }
}

/// Our chunks enclosing or preceding `time`; peers call this
async fn chunks(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<ChunksReq>, QueryRejection>,
) -> axum::response::Response {
    async fn chunks1(
        state: &Concurrent,
        req: std::result::Result<Query<ChunksReq>, QueryRejection>,
    ) -> Result<HashMap<String, concurrent_shared::entities::Chunk>> {
        let Query(req) = req.map_err(rejected)?;
        state
            .timelines
            .get_chunks(&split_csv(&req.timelines), time_of(req.time)?)
            .await
            .map_err(|err| TimelineSnafu.into_error(err))
    }
    match chunks1(&state, req).await {
        Ok(chunks) => ok(chunks),
        Err(err) => err.into_response(),
    }
}

/// Chunk iterators for a set of timelines at a given epoch
async fn chunk_itrs(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<ChunkItrReq>, QueryRejection>,
) -> axum::response::Response {
    async fn chunk_itrs1(
        state: &Concurrent,
        req: std::result::Result<Query<ChunkItrReq>, QueryRejection>,
    ) -> Result<HashMap<String, Epoch>> {
        let Query(req) = req.map_err(rejected)?;
        let epoch = req.epoch.parse::<Epoch>().map_err(rejected)?;
        let timelines = state.timelines.normalize_all(&split_csv(&req.timelines)).await;
        Ok(state
            .timelines
            .chunks()
            .lookup_chunk_itrs(&timelines, epoch)
            .await)
    }
    match chunk_itrs1(&state, req).await {
        Ok(itrs) => ok(itrs),
        Err(err) => err.into_response(),
    }
}

/// Chunk bodies named by `timeline:epoch` pairs
async fn chunk_bodies(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<ChunkBodyReq>, QueryRejection>,
) -> axum::response::Response {
    async fn chunk_bodies1(
        state: &Concurrent,
        req: std::result::Result<Query<ChunkBodyReq>, QueryRejection>,
    ) -> Result<HashMap<String, concurrent_shared::entities::Chunk>> {
        let Query(req) = req.map_err(rejected)?;
        let mut query = HashMap::new();
        for pair in split_csv(&req.query) {
            let (timeline, epoch) = pair.rsplit_once(':').ok_or_else(|| {
                BadRequestSnafu {
                    message: format!("{pair} is not of the form timeline:epoch"),
                }
                .build()
            })?;
            let epoch = epoch.parse::<Epoch>().map_err(rejected)?;
            let timeline = state
                .timelines
                .normalize_timeline_id(timeline)
                .await
                .map_err(|err| TimelineSnafu.into_error(err))?;
            query.insert(timeline, epoch);
        }
        Ok(state.timelines.chunks().load_chunk_bodies(&query).await)
    }
    match chunk_bodies1(&state, req).await {
        Ok(bodies) => ok(bodies),
        Err(err) => err.into_response(),
    }
}

/// Resources recently removed from a set of timelines
async fn retracted(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Query<RetractedReq>, QueryRejection>,
) -> axum::response::Response {
    let Query(req) = match req {
        Ok(req) => req,
        Err(err) => return rejected(err).into_response(),
    };
    let timelines = state.timelines.normalize_all(&split_csv(&req.timelines)).await;
    ok(state
        .timelines
        .chunks()
        .list_recently_removed_items(&timelines)
        .await)
}

/// A peer pushes an item into one of our timelines
async fn checkpoint(
    State(state): State<Arc<Concurrent>>,
    req: std::result::Result<Json<CheckpointReq>, JsonRejection>,
) -> axum::response::Response {
    async fn checkpoint1(
        state: &Concurrent,
        req: std::result::Result<Json<CheckpointReq>, JsonRejection>,
    ) -> Result<TimelineItem> {
        let Json(req) = req.map_err(rejected)?;
        state
            .timelines
            .checkpoint(req)
            .await
            .map_err(|err| TimelineSnafu.into_error(err))
    }
    match checkpoint1(&state, req).await {
        Ok(item) => {
            info!("Accepted {} from a peer", item.resource_id);
            ok(item)
        }
        Err(err) => err.into_response(),
    }
}

/// The chain of keys from a subkey up to its root
async fn key(
    State(state): State<Arc<Concurrent>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match state.key_chain.get_key_resolution(&id).await {
        Ok(keys) => ok(keys),
        Err(err) => KeyChainSnafu.into_error(err).into_response(),
    }
}

/// Describe this node
async fn domain(State(state): State<Arc<Concurrent>>) -> axum::response::Response {
    ok(&state.domain)
}

/// Filtered items from one of our timelines
async fn query(
    State(state): State<Arc<Concurrent>>,
    Path(id): Path<String>,
    req: std::result::Result<Query<QueryReq>, QueryRejection>,
) -> axum::response::Response {
    async fn query1(
        state: &Concurrent,
        id: &str,
        req: std::result::Result<Query<QueryReq>, QueryRejection>,
    ) -> Result<Vec<TimelineItem>> {
        let Query(req) = req.map_err(rejected)?;
        let query = ItemQuery {
            schema: req.schema,
            owner: req.owner,
            author: req.author,
            until: req.until.map(time_of).transpose()?,
            limit: limit_of(req.limit),
        };
        state
            .timelines
            .query(id, &query)
            .await
            .map_err(|err| TimelineSnafu.into_error(err))
    }
    match query1(&state, &id, req).await {
        Ok(items) => ok(items),
        Err(err) => err.into_response(),
    }
}

/// Return a router for the `/api/v1` surface
pub fn make_router(state: Arc<Concurrent>) -> Router<Arc<Concurrent>> {
    Router::new()
        .route("/commit", post(commit))
        .route("/timeline/{id}", get(get_timeline))
        .route("/timeline/{id}/query", get(query))
        .route("/timelines", get(by_schema))
        .route("/timelines/mine", get(by_author))
        .route("/timelines/recent", get(recent))
        .route("/timelines/range", get(range))
        .route("/timelines/chunks", get(chunks))
        .route("/timelines/chunks/itr", get(chunk_itrs))
        .route("/timelines/chunks/body", get(chunk_bodies))
        .route("/timelines/retracted", get(retracted))
        .route("/timelines/checkpoint", post(checkpoint))
        .route("/timelines/{id}", get(get_timeline))
        .route("/key/{id}", get(key))
        .route("/domain", get(domain))
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        // The websocket upgrade response mustn't carry a JSON content type
        .route("/timelines/realtime", get(realtime))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      operational endpoints                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// 200 iff the database & the cache both answer promptly
async fn health(State(state): State<Arc<Concurrent>>) -> axum::response::Response {
    let probes = async {
        state.storage.ping().await.map_err(|err| err.to_string())?;
        state.cache.ping().await.map_err(|err| err.to_string())
    };
    match tokio::time::timeout(HEALTH_TIMEOUT, probes).await {
        Ok(Ok(())) => (StatusCode::OK, "ok").into_response(),
        Ok(Err(err)) => {
            warn!("Health check failed: {err}");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
        Err(_) => {
            warn!("Health check timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<Concurrent>>) -> axum::response::Response {
    let mut output = Vec::new();
    match state.exporter.export(&mut output) {
        Ok(_) => match String::from_utf8(output) {
            Ok(text) => (StatusCode::OK, text).into_response(),
            Err(err) => {
                error!("Non UTF-8 Prometheus exporter response: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(err) => {
            error!("Failed to encode Prometheus metrics: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // OTel names must be ASCII and belong to the alphanumeric characters, '_', '.', '-' and '/'.
    // Here, I remove any illegal characters & replace '/' with '.'.
    let stem: String = request
        .uri()
        .path()
        .chars()
        .filter_map(|c| match c {
            '/' => Some('.'),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => Some(c),
            _ => None,
        })
        .collect();
    let name = format!("http.{}{}", request.method().as_str().to_lowercase(), stem);
    opentelemetry::global::meter("concurrent")
        .u64_counter(name)
        .build()
        .add(1, &[]);
    next.run(request).await
}

/// Counter for generating request IDs
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| HeaderValue::from_str(&s).ok())
            .map(RequestId::new)
    }
}

/// Make the [Router] the node serves to the world
pub fn make_world_router(state: Arc<Concurrent>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/api/v1", make_router(state.clone()))
        //                 requests
        //                    |
        //                    v
        // +---------  SetRequestIdLayer      ---------+
        // | +-------      OTEL layer         -------+ |
        // | | +-----      TraceLayer         -----+ | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | | |          handler              | | | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | +-----      TraceLayer         -----+ | |
        // | +-------      OTEL Layer         -------+ |
        // +---------   SetRequestIdLayer     ---------+
        //                    |
        //                    v
        //                responses
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(axum::middleware::from_fn(otel_middleware))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}
