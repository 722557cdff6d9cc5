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
//! Requests & responses for the node's `/api/v1` surface, shared by the node, its peers & its
//! clients.

use serde::{Deserialize, Serialize};

use crate::entities::TimelineItem;

/// Every successful response is wrapped in this envelope
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope<T> {
    pub status: String,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub content: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(content: T) -> Envelope<T> {
        Envelope {
            status: "ok".to_owned(),
            content: Some(content),
            error: None,
        }
    }
}

/// Split a comma-separated list of timeline references, dropping empties
pub fn split_csv(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             commit                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommitReq {
    pub document: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           timelines                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Query parameters for `/timelines/recent`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecentReq {
    pub timelines: String,
    /// Unix seconds; defaults to now
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

/// Query parameters for `/timelines/range`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RangeReq {
    pub timelines: String,
    /// Unix seconds
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

/// Query parameters for `/timelines/chunks`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChunksReq {
    pub timelines: String,
    /// Unix seconds
    pub time: i64,
}

/// Query parameters for `/timelines/chunks/itr`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChunkItrReq {
    pub timelines: String,
    pub epoch: String,
}

/// Query parameters for `/timelines/chunks/body`; `query` is a comma-separated list of
/// `timeline:epoch` pairs
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChunkBodyReq {
    pub query: String,
}

/// Query parameters for `/timelines/retracted`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RetractedReq {
    pub timelines: String,
}

/// Query parameters for `/timelines`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BySchemaReq {
    pub schema: String,
}

/// Query parameters for `/timelines/mine`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ByAuthorReq {
    pub author: String,
}

/// Query parameters for `/timeline/{id}/query`
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryReq {
    pub schema: Option<String>,
    pub owner: Option<String>,
    pub author: Option<String>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

/// Body of `POST /timelines/checkpoint`: a peer posting an item into one of our timelines
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckpointReq {
    pub timeline: String,
    pub item: TimelineItem,
    pub document: String,
    pub signature: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            realtime                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Control frames on the realtime websocket (events travel as bare
/// [Event](crate::entities::Event)s)
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RealtimeFrame {
    /// Replace the connection's subscription set
    Listen { channels: Vec<String> },
    Heartbeat,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frames() {
        let f: RealtimeFrame =
            serde_json::from_str(r#"{"type":"listen","channels":["ta@b"]}"#).unwrap();
        assert_eq!(
            f,
            RealtimeFrame::Listen {
                channels: vec!["ta@b".to_owned()]
            }
        );
        assert_eq!(
            serde_json::to_string(&RealtimeFrame::Heartbeat).unwrap(),
            r#"{"type":"heartbeat"}"#
        );
        assert_eq!(split_csv("a, b,,c"), vec!["a", "b", "c"]);
        let env = serde_json::to_string(&Envelope::ok(1)).unwrap();
        assert_eq!(env, r#"{"status":"ok","content":1}"#);
    }
}
