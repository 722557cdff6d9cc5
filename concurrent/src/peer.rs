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

//! # peers
//!
//! Everything the node asks of other nodes over HTTP: their chunks, key chains, timelines,
//! recently-retracted items & domain descriptions, plus pushing items into their timelines.
//!
//! Peers are addressed by FQDN. By default a peer `example.com` is reached at
//! `https://example.com`; configuration may map particular peers to other origins (private
//! deployments, test rigs).

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use chrono::Utc;
use http::{header, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, warn};
use url::Url;

use concurrent_shared::{
    api::{CheckpointReq, Envelope},
    entities::{split_qualified, Chunk, Domain, Key, Timeline, TimelineItem},
    epoch::Epoch,
};

use crate::{
    client::Client,
    storage::{self, Backend as StorageBackend},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to build a request for {url}: {source}"))]
    BuildRequest {
        url: Url,
        source: http::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{fqdn} lives in dimension {theirs}, not {ours}"))]
    Dimension {
        fqdn: String,
        theirs: String,
        ours: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize a request body: {source}"))]
    Encode {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse the response from {url}: {source}"))]
    Json {
        url: Url,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The response from {url} carried no content"))]
    NoContent { url: Url, backtrace: Backtrace },
    #[snafu(display("The origin for {fqdn} is not a legal URL: {source}"))]
    Origin {
        fqdn: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("While requesting {url}, {source}"))]
    Request {
        url: Url,
        source: BoxError,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} has no websocket equivalent"))]
    Scheme { url: Url, backtrace: Backtrace },
    #[snafu(display("{url} answered {status}"))]
    Status {
        url: Url,
        status: StatusCode,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// True if the peer answered, but said it doesn't have the thing requested
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Peers                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Client for the node's peers
pub struct Peers {
    client: Client,
    storage: Arc<dyn StorageBackend + Send + Sync>,
    dimension: String,
    origins: HashMap<String, Url>,
}

impl Peers {
    pub fn new(
        client: Client,
        storage: Arc<dyn StorageBackend + Send + Sync>,
        dimension: &str,
        origins: HashMap<String, Url>,
    ) -> Peers {
        Peers {
            client,
            storage,
            dimension: dimension.to_owned(),
            origins,
        }
    }

    /// The origin at which `fqdn` is reached
    pub fn origin(&self, fqdn: &str) -> Result<Url> {
        match self.origins.get(fqdn) {
            Some(url) => Ok(url.clone()),
            None => Url::parse(&format!("https://{fqdn}")).context(OriginSnafu { fqdn }),
        }
    }

    /// The URL of `fqdn`'s realtime endpoint
    pub fn ws_url(&self, fqdn: &str) -> Result<Url> {
        let mut url = self.endpoint(fqdn, "/api/v1/timelines/realtime")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return SchemeSnafu { url }.fail(),
        };
        if url.set_scheme(scheme).is_err() {
            return SchemeSnafu { url }.fail();
        }
        Ok(url)
    }

    fn endpoint(&self, fqdn: &str, path: &str) -> Result<Url> {
        self.origin(fqdn)?
            .join(path)
            .context(OriginSnafu { fqdn })
    }

    async fn send(&self, method: Method, url: Url, body: Bytes) -> Result<Bytes> {
        let request = http::Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .context(BuildRequestSnafu { url: url.clone() })?;
        let mut client = self.client.clone();
        let rsp = client
            .ready()
            .await
            .map_err(|err| RequestSnafu { url: url.clone() }.into_error(err))?
            .call(request)
            .await
            .map_err(|err| RequestSnafu { url: url.clone() }.into_error(err))?;
        if !rsp.status().is_success() {
            return StatusSnafu {
                url,
                status: rsp.status(),
            }
            .fail();
        }
        Ok(rsp.into_body())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let body = self.send(Method::GET, url.clone(), Bytes::new()).await?;
        serde_json::from_slice::<Envelope<T>>(&body)
            .context(JsonSnafu { url: url.clone() })?
            .content
            .context(NoContentSnafu { url })
    }

    async fn post_json<B: Serialize>(&self, url: Url, body: &B) -> Result<()> {
        let body = serde_json::to_vec(body).context(EncodeSnafu)?;
        self.send(Method::POST, url, Bytes::from(body)).await?;
        Ok(())
    }

    /// Retrieve an arbitrary document (a policy, say) by URL
    pub async fn fetch(&self, url: &Url) -> Result<Bytes> {
        self.send(Method::GET, url.clone(), Bytes::new()).await
    }

    /// Ask `fqdn` to describe itself
    pub async fn fetch_domain(&self, fqdn: &str) -> Result<Domain> {
        let mut domain: Domain = self
            .get_json(self.endpoint(fqdn, "/api/v1/domain")?)
            .await?;
        // Trust our own name for the peer over whatever it calls itself
        domain.fqdn = fqdn.to_owned();
        domain.last_scraped = Some(Utc::now());
        Ok(domain)
    }

    /// Look-up `fqdn`, from storage if we've seen it before, from the peer itself if not
    pub async fn domain(&self, fqdn: &str) -> Result<Domain> {
        if let Some(domain) = self.storage.get_domain(fqdn).await.context(StorageSnafu)? {
            return Ok(domain);
        }
        let domain = self.fetch_domain(fqdn).await?;
        self.storage
            .upsert_domain(&domain)
            .await
            .context(StorageSnafu)?;
        Ok(domain)
    }

    /// Fail unless `fqdn` federates with us
    pub async fn ensure_same_dimension(&self, fqdn: &str) -> Result<Domain> {
        let domain = self.domain(fqdn).await?;
        if domain.dimension != self.dimension {
            return DimensionSnafu {
                fqdn,
                theirs: domain.dimension,
                ours: self.dimension.clone(),
            }
            .fail();
        }
        Ok(domain)
    }

    /// Fetch the chunks of `timelines` (all hosted by `fqdn`) enclosing or preceding `epoch`
    ///
    /// Items claiming to belong to some timeline not hosted by `fqdn` are dropped.
    pub async fn get_chunks(
        &self,
        fqdn: &str,
        timelines: &[String],
        epoch: Epoch,
    ) -> Result<HashMap<String, Chunk>> {
        let mut url = self.endpoint(fqdn, "/api/v1/timelines/chunks")?;
        url.query_pairs_mut()
            .append_pair("timelines", &timelines.join(","))
            .append_pair("time", &epoch.to_string());
        let chunks: HashMap<String, Chunk> = self.get_json(url).await?;
        Ok(chunks
            .into_iter()
            .filter(|(timeline, _)| split_qualified(timeline).1 == Some(fqdn))
            .map(|(timeline, mut chunk)| {
                let before = chunk.items.len();
                chunk
                    .items
                    .retain(|item| split_qualified(&item.timeline_id).1 == Some(fqdn));
                if chunk.items.len() != before {
                    warn!(
                        "{fqdn} returned {} foreign items in the chunk for {timeline}",
                        before - chunk.items.len()
                    );
                }
                (timeline, chunk)
            })
            .collect())
    }

    /// The chain of keys from `key_id` up to its root, as `fqdn` knows it
    pub async fn get_key_resolution(&self, fqdn: &str, key_id: &str) -> Result<Vec<Key>> {
        self.get_json(self.endpoint(fqdn, &format!("/api/v1/key/{key_id}"))?)
            .await
    }

    /// Fetch a timeline's metadata from the peer hosting it
    pub async fn get_timeline(&self, fqdn: &str, timeline: &str) -> Result<Timeline> {
        self.get_json(self.endpoint(fqdn, &format!("/api/v1/timeline/{timeline}"))?)
            .await
    }

    /// Recently retracted resource ids for each of `timelines`
    pub async fn get_retracted(
        &self,
        fqdn: &str,
        timelines: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut url = self.endpoint(fqdn, "/api/v1/timelines/retracted")?;
        url.query_pairs_mut()
            .append_pair("timelines", &timelines.join(","));
        self.get_json(url).await
    }

    /// Items in `timelines` newer than `since` (& older than `until`), oldest first
    pub async fn get_range(
        &self,
        fqdn: &str,
        timelines: &[String],
        since: i64,
        until: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let mut url = self.endpoint(fqdn, "/api/v1/timelines/range")?;
        url.query_pairs_mut()
            .append_pair("timelines", &timelines.join(","))
            .append_pair("since", &since.to_string())
            .append_pair("limit", &limit.to_string());
        if let Some(until) = until {
            url.query_pairs_mut().append_pair("until", &until.to_string());
        }
        self.get_json(url).await
    }

    /// Push an item into a timeline hosted by `fqdn`
    pub async fn post_checkpoint(&self, fqdn: &str, req: &CheckpointReq) -> Result<()> {
        debug!("Forwarding {} to {fqdn}", req.item.resource_id);
        self.post_json(self.endpoint(fqdn, "/api/v1/timelines/checkpoint")?, req)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{client::make_client, memory::MemoryBackend, metrics::Instruments};

    async fn peers_for(server: &MockServer, dimension: &str) -> Peers {
        let client = make_client(
            "concurrent unit tests",
            Arc::new(Instruments::new("concurrent-test")),
        )
        .unwrap();
        Peers::new(
            client,
            Arc::new(MemoryBackend::new()),
            dimension,
            HashMap::from([(
                "peer.example".to_owned(),
                Url::parse(&server.uri()).unwrap(),
            )]),
        )
    }

    #[tokio::test]
    async fn foreign_items_are_dropped() {
        let server = MockServer::start().await;
        let tl = "t0000000000000000000000000@peer.example";
        Mock::given(method("GET"))
            .and(path("/api/v1/timelines/chunks"))
            .and(query_param("time", "1800"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": {
                    tl: {
                        "key": format!("tl:body:{tl}:1800"),
                        "epoch": "1800",
                        "items": [
                            {"resourceID": "mA", "timelineID": tl, "owner": "con1a",
                             "cdate": "1970-01-01T00:31:00Z"},
                            {"resourceID": "mB",
                             "timelineID": "t0000000000000000000000000@evil.example",
                             "owner": "con1a", "cdate": "1970-01-01T00:32:00Z"}
                        ]
                    },
                    "t1111111111111111111111111@evil.example": {
                        "key": "x", "epoch": "1800", "items": []
                    }
                }
            })))
            .mount(&server)
            .await;

        let peers = peers_for(&server, "cc-main").await;
        let chunks = peers
            .get_chunks("peer.example", &[tl.to_owned()], Epoch::of_secs(1800))
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[tl].items.len(), 1);
        assert_eq!(chunks[tl].items[0].resource_id, "mA");
        assert_eq!(
            chunks[tl].items[0].cdate,
            Utc.timestamp_opt(1860, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn dimensions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/domain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": {"fqdn": "peer.example", "ccid": "con1x", "csid": "ccs1x",
                            "dimension": "cc-other"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let peers = peers_for(&server, "cc-main").await;
        assert!(matches!(
            peers.ensure_same_dimension("peer.example").await,
            Err(Error::Dimension { .. })
        ));
        // second time around the domain comes from storage
        assert_eq!(
            peers.domain("peer.example").await.unwrap().dimension,
            "cc-other"
        );
    }

    #[tokio::test]
    async fn failures_surface() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/key/cck1nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let peers = peers_for(&server, "cc-main").await;
        let err = peers
            .get_key_resolution("peer.example", "cck1nope")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            peers.ws_url("peer.example").unwrap().scheme(),
            "ws"
        );
        assert_eq!(
            peers.ws_url("other.example").unwrap().as_str(),
            "wss://other.example/api/v1/timelines/realtime"
        );
    }
}
