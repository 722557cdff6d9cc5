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

//! Single-node scenarios, driven over HTTP

mod common;

use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::json;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use concurrent::{
    cache::Cache,
    chunk_store::{body_key, itr_key},
    storage::Backend,
};
use concurrent_shared::{entities::Entity, epoch::Epoch};

use common::*;

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[tokio::test]
async fn write_then_read() {
    let mut nodes = spawn_nodes(&["ours.example"]).await;
    let ours = &nodes[0];
    let alice = ccid(ALICE);

    let timeline = ours
        .commit_ok(&signed(
            &timeline_doc(&alice, "home", None, at(1_699_999_000)),
            ALICE,
            &alice,
        ))
        .await;
    let id = format!("{}@ours.example", timeline["id"].as_str().unwrap());

    let message = ours
        .commit_ok(&signed(
            &message_doc(&alice, &[id.clone()], "hello", at(1_700_000_000)),
            ALICE,
            &alice,
        ))
        .await;
    let resource = message["id"].as_str().unwrap().to_owned();
    assert!(resource.starts_with('m'));

    let recent = format!("/timelines/recent?timelines={id}&until=1700000060&limit=10");
    let (status, body) = ours.get(&recent).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["content"].as_array().unwrap().clone();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["resourceID"], resource.as_str());

    // the semantic id works just as well
    let (_, by_name) = ours
        .get(&format!("/timelines/recent?timelines=home@{alice}&until=1700000060"))
        .await;
    assert_eq!(by_name["content"], body["content"]);

    // Flush the cached chunks; the same query rebuilds them from the database
    let state = ours.state();
    state.cache.delete_prefix("tl:").await.unwrap();
    let (_, again) = ours.get(&recent).await;
    assert_eq!(again["content"], body["content"]);
    let epoch = Epoch::of_secs(1_700_000_000);
    assert_eq!(epoch.secs(), 1_699_999_800);
    assert!(state.cache.get(&itr_key(&id, epoch)).await.unwrap().is_some());
    assert!(state.cache.get(&body_key(&id, epoch)).await.unwrap().is_some());

    // `until` is exclusive
    let (_, none) = ours
        .get(&format!("/timelines/recent?timelines={id}&until=1700000000"))
        .await;
    assert_eq!(none["content"], json!([]));

    // ranges run forward from `since`
    let (_, range) = ours
        .get(&format!("/timelines/range?timelines={id}&since=1699999999"))
        .await;
    assert_eq!(range["content"].as_array().unwrap().len(), 1);

    // the item is also visible through the timeline query
    let (status, query) = ours
        .get(&format!(
            "/timeline/{}/query?schema=https://schema.example/note",
            timeline["id"].as_str().unwrap()
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(query["content"].as_array().unwrap().len(), 1);

    // retract it; it drops out of reads & shows up as recently removed
    ours.commit_ok(&signed(
        &json!({"signer": alice, "type": "retract", "timeline": id, "target": resource,
                "signedAt": at(1_700_000_100)}),
        ALICE,
        &alice,
    ))
    .await;
    let (_, after) = ours.get(&recent).await;
    assert_eq!(after["content"], json!([]));
    let (_, retracted) = ours.get(&format!("/timelines/retracted?timelines={id}")).await;
    assert_eq!(retracted["content"][&id], json!([resource]));

    nodes[0].stop().await;
}

#[tokio::test]
async fn revoked_key_rejected() {
    let mut nodes = spawn_nodes(&["ours.example"]).await;
    let ours = &nodes[0];
    let alice = ccid(ALICE);
    let k1 = ckid(K1);

    ours.commit_ok(&signed(
        &json!({"signer": alice, "type": "enact", "target": k1, "root": alice,
                "parent": alice, "signedAt": at(1000)}),
        ALICE,
        &alice,
    ))
    .await;
    let (status, chain) = ours.get(&format!("/key/{k1}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chain["content"].as_array().unwrap().len(), 1);

    let mut by_k1 = timeline_doc(&alice, "work", None, at(2000));
    by_k1["keyID"] = json!(k1);
    ours.commit_ok(&signed(&by_k1, K1, &k1)).await;

    ours.commit_ok(&signed(
        &json!({"signer": alice, "type": "revoke", "target": k1, "signedAt": at(3000)}),
        ALICE,
        &alice,
    ))
    .await;

    by_k1["signedAt"] = json!(at(4000));
    let (status, body) = ours.commit(&signed(&by_k1, K1, &k1)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "AuthenticationFailed");

    nodes[0].stop().await;
}

#[tokio::test]
async fn timeline_policy_decides_distribution() {
    let policies = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policies/no-muted.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statements": {
                "timeline.distribute": {
                    "condition": {"op": "Not", "args": [
                        {"op": "RequesterHasTag", "const": "_muted"}
                    ]}
                }
            }
        })))
        .mount(&policies)
        .await;

    let mut nodes = spawn_nodes(&["ours.example"]).await;
    let ours = &nodes[0];
    let state = ours.state();
    let (alice, bob, carol) = (ccid(ALICE), ccid(BOB), ccid(CAROL));
    for (who, tag) in [(&bob, "_muted"), (&carol, "")] {
        state
            .storage
            .upsert_entity(&Entity {
                ccid: who.clone(),
                domain: "ours.example".to_owned(),
                tag: tag.to_owned(),
                alias: None,
                cdate: at(0),
            })
            .await
            .unwrap();
    }

    let url = format!("{}/policies/no-muted.json", policies.uri());
    let timeline = ours
        .commit_ok(&signed(
            &timeline_doc(&alice, "open", Some(&url), at(1_700_000_000)),
            ALICE,
            &alice,
        ))
        .await;
    let id = format!("{}@ours.example", timeline["id"].as_str().unwrap());

    let (status, body) = ours
        .commit(&signed(
            &message_doc(&bob, &[id.clone()], "let me in", at(1_700_000_010)),
            BOB,
            &bob,
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "AuthorisationFailed");

    ours.commit_ok(&signed(
        &message_doc(&carol, &[id.clone()], "hi", at(1_700_000_020)),
        CAROL,
        &carol,
    ))
    .await;

    // the global policy still has the last word
    state
        .storage
        .upsert_entity(&Entity {
            ccid: carol.clone(),
            domain: "ours.example".to_owned(),
            tag: "_block".to_owned(),
            alias: None,
            cdate: at(0),
        })
        .await
        .unwrap();
    let (status, _) = ours
        .commit(&signed(
            &message_doc(&carol, &[id], "hi again", at(1_700_000_030)),
            CAROL,
            &carol,
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    nodes[0].stop().await;
}

#[tokio::test]
async fn operational_endpoints() {
    let mut nodes = spawn_nodes(&["ours.example"]).await;
    let ours = &nodes[0];
    let client = reqwest::Client::new();

    let rsp = client
        .get(format!("http://{}/health", ours.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(rsp.text().await.unwrap(), "ok");

    let rsp = client
        .get(format!("http://{}/metrics", ours.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);

    let (status, domain) = ours.get("/domain").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(domain["content"]["fqdn"], "ours.example");
    assert_eq!(domain["content"]["dimension"], DIMENSION);

    // malformed requests
    let (status, body) = ours.get("/timelines/recent").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");
    let (status, _) = ours.get("/timelines/chunks/body?query=nocolon").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let rsp = client
        .post(ours.url("/commit"))
        .header("content-type", "application/json")
        .body("{")
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

    nodes[0].stop().await;
}
