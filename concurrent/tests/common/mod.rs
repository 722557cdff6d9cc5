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

//! Helpers shared by the integration tests: in-process nodes listening on loopback, & signing.
#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde_json::Value;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use url::Url;

use concurrent::{
    api::make_world_router,
    concurrent::{Concurrent, Node},
    config::ConfigV1,
};
use concurrent_shared::{
    api::CommitReq,
    crypto::{derive_address, sign, Scheme},
};

pub const DIMENSION: &str = "cc-integration";

pub const ALICE: &str = "4646464646464646464646464646464646464646464646464646464646464646";
pub const BOB: &str = "0303030303030303030303030303030303030303030303030303030303030303";
pub const CAROL: &str = "0505050505050505050505050505050505050505050505050505050505050505";
pub const K1: &str = "0101010101010101010101010101010101010101010101010101010101010101";

const NODE_KEYS: [&str; 3] = [
    "0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a",
    "0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b",
    "0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c",
];

pub fn ccid(private_key: &str) -> String {
    derive_address(private_key, Scheme::Bech32("con")).unwrap()
}

pub fn ckid(private_key: &str) -> String {
    derive_address(private_key, Scheme::Bech32("cck")).unwrap()
}

/// Sign `doc` with `private_key`, whose address is `address`
pub fn signed(doc: &Value, private_key: &str, address: &str) -> CommitReq {
    let document = doc.to_string();
    let signature = sign(private_key, document.as_bytes(), Scheme::of(address).unwrap()).unwrap();
    CommitReq {
        document,
        signature,
        option: None,
    }
}

/// A node serving on loopback
pub struct TestNode {
    pub fqdn: String,
    pub addr: SocketAddr,
    node: Option<Node>,
    stop: CancellationToken,
    server: Option<JoinHandle<()>>,
    client: reqwest::Client,
}

impl TestNode {
    pub fn state(&self) -> Arc<Concurrent> {
        self.node.as_ref().unwrap().state()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/timelines/realtime", self.addr)
    }

    /// Commit `req`; return the status & the (parsed) response body
    pub async fn commit(&self, req: &CommitReq) -> (reqwest::StatusCode, Value) {
        let rsp = self
            .client
            .post(self.url("/commit"))
            .json(req)
            .send()
            .await
            .unwrap();
        let status = rsp.status();
        (status, rsp.json().await.unwrap())
    }

    /// Commit `req`, insisting on success; return the envelope's content
    pub async fn commit_ok(&self, req: &CommitReq) -> Value {
        let (status, body) = self.commit(req).await;
        assert_eq!(status, reqwest::StatusCode::OK, "{body}");
        assert_eq!(body["status"], "ok");
        body["content"].clone()
    }

    pub async fn get(&self, path_and_query: &str) -> (reqwest::StatusCode, Value) {
        let rsp = self.client.get(self.url(path_and_query)).send().await.unwrap();
        let status = rsp.status();
        (status, rsp.json().await.unwrap_or(Value::Null))
    }

    /// Stop serving & shut the node down
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(server) = self.server.take() {
            server.await.unwrap();
        }
        if let Some(node) = self.node.take() {
            node.shutdown().await;
        }
    }
}

/// Start one node per name in `fqdns`; every node can reach every other over loopback
pub async fn spawn_nodes(fqdns: &[&str]) -> Vec<TestNode> {
    assert!(fqdns.len() <= NODE_KEYS.len());
    let mut listeners = Vec::new();
    for _ in fqdns {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let origins: HashMap<String, Url> = fqdns
        .iter()
        .zip(listeners.iter())
        .map(|(fqdn, listener)| {
            (
                fqdn.to_string(),
                Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap(),
            )
        })
        .collect();

    let mut nodes = Vec::new();
    for ((fqdn, listener), key) in fqdns.iter().zip(listeners).zip(NODE_KEYS) {
        let addr = listener.local_addr().unwrap();
        let cfg = ConfigV1 {
            fqdn: fqdn.to_string(),
            private_key: key.to_owned(),
            dimension: DIMENSION.to_owned(),
            public_address: addr,
            peer_origins: origins.clone(),
            ..Default::default()
        };
        let node = Node::new(&cfg, PrometheusExporter::new()).await.unwrap();
        let stop = CancellationToken::new();
        let router = make_world_router(node.state());
        let server = tokio::spawn({
            let stop = stop.clone();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
                    .unwrap();
            }
        });
        nodes.push(TestNode {
            fqdn: fqdn.to_string(),
            addr,
            node: Some(node),
            stop,
            server: Some(server),
            client: reqwest::Client::new(),
        });
    }
    nodes
}

/// A timeline document for `signer`
pub fn timeline_doc(signer: &str, semantic_id: &str, policy: Option<&str>, at: DateTime<Utc>) -> Value {
    let mut doc = serde_json::json!({
        "signer": signer,
        "type": "timeline",
        "schema": "https://schema.example/tl",
        "indexable": true,
        "domainOwned": false,
        "semanticID": semantic_id,
        "body": {"name": semantic_id},
        "signedAt": at,
    });
    if let Some(policy) = policy {
        doc["policy"] = Value::String(policy.to_owned());
    }
    doc
}

/// A message document posting into `timelines`
pub fn message_doc(signer: &str, timelines: &[String], text: &str, at: DateTime<Utc>) -> Value {
    serde_json::json!({
        "signer": signer,
        "type": "message",
        "schema": "https://schema.example/note",
        "body": {"text": text},
        "timelines": timelines,
        "signedAt": at,
    })
}
