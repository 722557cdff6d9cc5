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

//! # concurrent entities
//!
//! The records that the timeline subsystem reads, writes & ships between nodes. Field names on the
//! wire follow the established protocol (camelCase, with a few all-caps abbreviations like
//! `resourceID`), hence the `serde` renames throughout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::epoch::Epoch;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn is_bech32_id(text: &str, hrp: &str) -> bool {
    text.len() == 42
        && text.starts_with(hrp)
        && text[hrp.len()..].starts_with('1')
        && text.chars().all(|c| c.is_ascii_alphanumeric())
}

fn is_legacy_id(text: &str, prefix: &str) -> bool {
    text.len() == 42 && text.starts_with(prefix) && text[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Return true if `text` looks like an account ID (`con1...` or legacy `CC...`)
pub fn is_ccid(text: &str) -> bool {
    is_bech32_id(text, "con") || is_legacy_id(text, "CC")
}

/// Return true if `text` looks like a subkey ID (`cck1...` or legacy `CK...`)
pub fn is_ckid(text: &str) -> bool {
    is_bech32_id(text, "cck") || is_legacy_id(text, "CK")
}

/// Return true if `text` looks like a domain signing ID (`ccs1...`)
pub fn is_csid(text: &str) -> bool {
    is_bech32_id(text, "ccs")
}

/// Split a possibly-qualified reference (`t0123...@example.com`) into its id & resolver
pub fn split_qualified(text: &str) -> (&str, Option<&str>) {
    match text.split_once('@') {
        Some((id, resolver)) if !resolver.is_empty() => (id, Some(resolver)),
        Some((id, _)) => (id, None),
        None => (text, None),
    }
}

/// Return true if the comma-separated tag string `tags` contains `tag`
pub fn has_tag(tags: &str, tag: &str) -> bool {
    tags.split(',').map(str::trim).any(|t| t == tag)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Key                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A subkey, enacted by its parent & (perhaps) revoked later
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub id: String,
    pub root: String,
    pub parent: String,
    pub enact_document: String,
    pub enact_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_signature: Option<String>,
    pub valid_since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl Key {
    /// The presence of a revocation document is what makes a key revoked; `valid_until` only says
    /// when
    pub fn is_revoked(&self) -> bool {
        self.revoke_document.is_some()
    }
    /// A key is effective at `t` if it was enacted at or before `t` and, if revoked, `t` precedes
    /// the revocation. A revoked key with no recorded revocation time is never effective.
    pub fn is_effective_at(&self, t: &DateTime<Utc>) -> bool {
        if self.valid_since > *t {
            return false;
        }
        if !self.is_revoked() {
            return true;
        }
        self.valid_until.is_some_and(|until| *t < until)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      Domain & Entity                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent node
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub fqdn: String,
    pub ccid: String,
    #[serde(default)]
    pub csid: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub dimension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default = "Utc::now")]
    pub cdate: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub mdate: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scraped: Option<DateTime<Utc>>,
}

impl Domain {
    pub fn has_tag(&self, tag: &str) -> bool {
        has_tag(&self.tag, tag)
    }
}

/// A user, local or remote
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub ccid: String,
    pub domain: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default = "Utc::now")]
    pub cdate: DateTime<Utc>,
}

impl Entity {
    pub fn has_tag(&self, tag: &str) -> bool {
        has_tag(&self.tag, tag)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     Timelines & their items                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A timeline; `id` is the bare, twenty-six character CDID
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub id: String,
    pub indexable: bool,
    pub owner: String,
    pub author: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_params: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_defaults: Option<String>,
    pub document: String,
    pub signature: String,
    pub cdate: DateTime<Utc>,
    pub mdate: DateTime<Utc>,
    #[serde(default)]
    pub domain_owned: bool,
}

/// A resource (a message, say) posted into a timeline
///
/// In storage `timeline_id` is the bare CDID; everywhere else it's fully-qualified:
/// `t<cdid>@<fqdn>`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimelineItem {
    #[serde(rename = "resourceID")]
    pub resource_id: String,
    #[serde(rename = "timelineID")]
    pub timeline_id: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub cdate: DateTime<Utc>,
}

impl TimelineItem {
    /// The type letter with which the resource id begins (`m` for messages, e.g.)
    pub fn resource_type(&self) -> Option<char> {
        self.resource_id.chars().next()
    }
    pub fn epoch(&self) -> Epoch {
        Epoch::of(&self.cdate)
    }
}

/// A ten-minute slice of one timeline, newest items first
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Chunk {
    pub key: String,
    pub epoch: Epoch,
    pub items: Vec<TimelineItem>,
}

/// Something that happened in a timeline
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Event {
    pub timeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<TimelineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default)]
    pub document: String,
    #[serde(default)]
    pub signature: String,
}

/// A human-friendly name, chosen by its owner, for some resource (a timeline, usually)
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SemanticId {
    pub id: String,
    pub owner: String,
    pub target: String,
    pub document: String,
    pub signature: String,
    pub cdate: DateTime<Utc>,
    pub mdate: DateTime<Utc>,
}
