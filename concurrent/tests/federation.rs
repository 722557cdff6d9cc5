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

//! Two nodes federating over loopback

mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::json;
use tokio_websockets::{ClientBuilder, Message};

use concurrent::{cache::Cache, chunk_store::body_key};
use concurrent_shared::{entities::Event, epoch::Epoch};

use common::*;

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Create a timeline for `private_key`'s account on `node`; return its fully-qualified id
async fn make_timeline(node: &TestNode, private_key: &str, name: &str, secs: i64) -> String {
    let account = ccid(private_key);
    let timeline = node
        .commit_ok(&signed(
            &timeline_doc(&account, name, None, at(secs)),
            private_key,
            &account,
        ))
        .await;
    format!("{}@{}", timeline["id"].as_str().unwrap(), node.fqdn)
}

async fn post(node: &TestNode, private_key: &str, timeline: &str, when: chrono::DateTime<Utc>) -> String {
    let account = ccid(private_key);
    let rsp = node
        .commit_ok(&signed(
            &message_doc(&account, &[timeline.to_owned()], "hello", when),
            private_key,
            &account,
        ))
        .await;
    rsp["id"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn federated_merge() {
    let mut nodes = spawn_nodes(&["ours.example", "peer.example"]).await;
    let (ours, peer) = (&nodes[0], &nodes[1]);

    let local = make_timeline(ours, ALICE, "home", 1_699_999_000).await;
    let remote = make_timeline(peer, BOB, "home", 1_699_999_000).await;
    let m_local = post(ours, ALICE, &local, at(1_700_000_000)).await;
    let m_remote = post(peer, BOB, &remote, at(1_700_000_030)).await;

    let (status, body) = ours
        .get(&format!(
            "/timelines/recent?timelines={local},{remote}&until=1700000060&limit=10"
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids = body["content"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["resourceID"].as_str().unwrap().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![m_remote, m_local]);

    // remote timeline metadata comes through, too
    let (status, timeline) = ours.get(&format!("/timeline/{remote}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(timeline["content"]["author"], ccid(BOB));

    for node in nodes.iter_mut() {
        node.stop().await;
    }
}

#[tokio::test]
async fn remote_events_update_the_cache() {
    // Keep the whole exchange inside one epoch
    let left = Epoch::current().end() - Utc::now();
    if left < chrono::Duration::seconds(30) {
        tokio::time::sleep(left.to_std().unwrap() + Duration::from_secs(1)).await;
    }

    let mut nodes = spawn_nodes(&["ours.example", "peer.example"]).await;
    let (ours, peer) = (&nodes[0], &nodes[1]);
    let remote = make_timeline(peer, BOB, "home", 1_699_999_000).await;
    let first = post(peer, BOB, &remote, Utc::now()).await;

    // A client listens to the remote timeline through us...
    let uri: http::Uri = ours.ws_url().parse().unwrap();
    let (mut client, _) = ClientBuilder::from_uri(uri).connect().await.unwrap();
    client
        .send(Message::text(
            json!({"type": "listen", "channels": [remote]}).to_string(),
        ))
        .await
        .unwrap();

    // ...so we subscribe to it on the peer
    let state = ours.state();
    let mut subscribed = false;
    for _ in 0..50 {
        let status = state.keeper.status().await.unwrap();
        if status.connections.contains(&"peer.example".to_owned())
            && status
                .remote_subs
                .get("peer.example")
                .is_some_and(|subs| subs.contains(&remote))
        {
            subscribed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(subscribed);
    // Give the peer a moment to act on our listen request
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Reading the timeline now caches its current chunk
    let until = (Utc::now() + chrono::Duration::seconds(1)).timestamp();
    let recent = format!("/timelines/recent?timelines={remote}&until={until}");
    let (_, body) = ours.get(&recent).await;
    assert_eq!(body["content"][0]["resourceID"], first.as_str());

    let second = post(peer, BOB, &remote, Utc::now()).await;

    let event = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let msg = client.next().await.unwrap().unwrap();
            if let Some(event) = msg
                .as_text()
                .and_then(|text| serde_json::from_str::<Event>(text).ok())
            {
                break event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.timeline, remote);
    assert_eq!(event.item.unwrap().resource_id, second);

    // The cached chunk catches up shortly after the event goes out
    let key = body_key(&remote, Epoch::current());
    let mut cached = false;
    for _ in 0..10 {
        if state
            .cache
            .get(&key)
            .await
            .unwrap()
            .is_some_and(|body| body.contains(&second))
        {
            cached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cached);

    // The peer goes away; we can still answer from cache
    nodes[1].stop().await;
    let until = (Utc::now() + chrono::Duration::seconds(1)).timestamp();
    let (status, body) = nodes[0]
        .get(&format!("/timelines/recent?timelines={remote}&until={until}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids = body["content"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["resourceID"].as_str().unwrap().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![second, first]);

    let _ = client.close().await;
    nodes[0].stop().await;
}
