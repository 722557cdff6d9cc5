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

//! # Signed documents
//!
//! Every mutation arrives as a JSON document plus a signature over its exact bytes. All documents
//! share a common header (`signer`, `type`, `signedAt` & friends); the remaining, type-specific
//! fields live alongside the header at the top level of the same object. I model that as a
//! [DocumentHeader] plus a [Body] selected by the `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, prelude::*};

use crate::{cdid::Cdid, crypto::keccak256, entities::TimelineItem};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse a {typ} document: {source}"))]
    Body {
        typ: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse the document header: {source}"))]
    Header {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The document names no signer"))]
    NoSigner { backtrace: Backtrace },
    #[snafu(display("Unsupported document type {typ}"))]
    UnsupportedType { typ: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        document header                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Fields common to all documents
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DocumentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub signer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(
        default,
        rename = "policyParams",
        skip_serializing_if = "Option::is_none"
    )]
    pub policy_params: Option<String>,
    #[serde(
        default,
        rename = "policyDefaults",
        skip_serializing_if = "Option::is_none"
    )]
    pub policy_defaults: Option<String>,
    #[serde(default, rename = "keyID", skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, rename = "semanticID", skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<String>,
    #[serde(rename = "signedAt")]
    pub signed_at: DateTime<Utc>,
}

impl DocumentHeader {
    /// The key that performed the signature: the subkey, if one was named, else the signer
    pub fn performer(&self) -> &str {
        self.key_id.as_deref().unwrap_or(&self.signer)
    }
    /// The account on whose behalf the document was signed
    pub fn owner(&self) -> &str {
        self.owner.as_deref().unwrap_or(&self.signer)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         document bodies                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EnactBody {
    pub target: String,
    pub root: String,
    pub parent: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TargetBody {
    pub target: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TimelineBody {
    #[serde(default)]
    pub indexable: bool,
    #[serde(default, rename = "domainOwned")]
    pub domain_owned: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MessageBody {
    #[serde(default)]
    pub timelines: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AssociationBody {
    pub target: String,
    #[serde(default)]
    pub timelines: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RetractBody {
    pub timeline: String,
    pub target: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventBody {
    pub timeline: String,
    #[serde(default)]
    pub item: Option<TimelineItem>,
    #[serde(default)]
    pub resource: Option<Value>,
    pub document: String,
    pub signature: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AffiliationBody {
    pub domain: String,
}

/// The type-specific part of a document
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    /// `enact` (or `c.key`): bring a subkey into effect
    Enact(EnactBody),
    /// `revoke` (or `d.key`): withdraw a subkey
    Revoke(TargetBody),
    /// `timeline` (or `t.timeline`): create or update a timeline
    Timeline(TimelineBody),
    /// `delete` (or `d.timeline`): delete whatever `target` names
    Delete(TargetBody),
    /// `message`: post a message into one or more timelines
    Message(MessageBody),
    /// `association`: attach a reaction to some resource, optionally posting it to timelines
    Association(AssociationBody),
    /// `retract`: remove an item from a timeline
    Retract(RetractBody),
    /// `event`: an event relayed verbatim
    Event(EventBody),
    /// `affiliation`: an account declares its home domain
    Affiliation(AffiliationBody),
    /// `tombstone`: an account is gone for good
    Tombstone,
}

impl Body {
    /// The one-letter prefix for ids of resources created by documents of this type, if any
    pub fn resource_prefix(&self) -> Option<char> {
        match self {
            Body::Timeline(_) => Some('t'),
            Body::Message(_) => Some('m'),
            Body::Association(_) => Some('a'),
            _ => None,
        }
    }
}

/// A parsed document
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub header: DocumentHeader,
    pub body: Body,
}

fn body_of<T: serde::de::DeserializeOwned>(text: &str, typ: &str) -> Result<T> {
    serde_json::from_str::<T>(text).context(BodySnafu { typ })
}

impl Document {
    /// Parse the text of a document; the header first, then the fields implied by its type
    pub fn parse(text: &str) -> Result<Document> {
        let header = serde_json::from_str::<DocumentHeader>(text).context(HeaderSnafu)?;
        ensure!(!header.signer.is_empty(), NoSignerSnafu);
        let typ = header.typ.as_str();
        let body = match typ {
            "enact" | "c.key" => Body::Enact(body_of(text, typ)?),
            "revoke" | "d.key" => Body::Revoke(body_of(text, typ)?),
            "timeline" | "t.timeline" => Body::Timeline(body_of(text, typ)?),
            "delete" | "d.timeline" => Body::Delete(body_of(text, typ)?),
            "message" => Body::Message(body_of(text, typ)?),
            "association" => Body::Association(body_of(text, typ)?),
            "retract" => Body::Retract(body_of(text, typ)?),
            "event" => Body::Event(body_of(text, typ)?),
            "affiliation" => Body::Affiliation(body_of(text, typ)?),
            "tombstone" => Body::Tombstone,
            _ => return UnsupportedTypeSnafu { typ }.fail(),
        };
        Ok(Document { header, body })
    }
}

/// The content-derived id of the resource created by `document`, signed at `signed_at`
pub fn resource_cdid(document: &str, signed_at: &DateTime<Utc>) -> Cdid {
    Cdid::from_digest(&keccak256(document.as_bytes()), signed_at)
}
