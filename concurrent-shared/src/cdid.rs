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

//! # Content-derived identifiers
//!
//! Most everything in concurrent that is created by a signed document is named by a "CDID": ten
//! bytes of the document's hash followed by the six low-order bytes of its signing time (in
//! milliseconds since the Unix epoch, big-endian), rendered in a lower-case base32 variant that
//! omits the easily-confused letters `i`, `l`, `o` & `u`. Sixteen bytes make for twenty-six
//! characters; there is no padding.
//!
//! Externally, CDIDs are qualified with a one-letter prefix naming the type of the resource (`t`
//! for timelines, `m` for messages and so forth).

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, TimeZone, Utc};
use data_encoding::{Encoding, Specification};
use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{Backtrace, prelude::*};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid CDID: {source}"))]
    Decode {
        text: String,
        source: data_encoding::DecodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} has length {len}; CDIDs are 26 characters"))]
    Length {
        text: String,
        len: usize,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////

pub const CDID_LEN: usize = 26;

const CDID_ALPHABET: &str = "0123456789abcdefghjkmnpqrstvwxyz";

lazy_static! {
    static ref CDID_ENCODING: Encoding = {
        let mut spec = Specification::new();
        spec.symbols.push_str(CDID_ALPHABET);
        spec.encoding().unwrap(/* known good */)
    };
}

/// A content-derived identifier
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cdid([u8; 16]);

impl Cdid {
    /// Build a [Cdid] from the leading ten bytes of some hash & a signing time
    pub fn new(hash: &[u8; 10], time: &DateTime<Utc>) -> Cdid {
        let mut bytes = [0u8; 16];
        bytes[..10].copy_from_slice(hash);
        let millis = time.timestamp_millis().to_be_bytes();
        bytes[10..].copy_from_slice(&millis[2..]);
        Cdid(bytes)
    }
    /// Convenience constructor taking the first ten bytes of `digest`
    pub fn from_digest(digest: &[u8; 32], time: &DateTime<Utc>) -> Cdid {
        let mut hash = [0u8; 10];
        hash.copy_from_slice(&digest[..10]);
        Cdid::new(&hash, time)
    }
    pub fn hash(&self) -> &[u8] {
        &self.0[..10]
    }
    /// The signing time embedded in this id, to millisecond precision
    pub fn timestamp(&self) -> DateTime<Utc> {
        let mut millis = [0u8; 8];
        millis[2..].copy_from_slice(&self.0[10..]);
        Utc.timestamp_millis_opt(i64::from_be_bytes(millis))
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
    /// Render this id with a type prefix (`t`, `m`, `a`, ...)
    pub fn with_prefix(&self, prefix: char) -> String {
        format!("{prefix}{self}")
    }
}

impl Display for Cdid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", CDID_ENCODING.encode(&self.0))
    }
}

impl FromStr for Cdid {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        ensure!(
            s.len() == CDID_LEN,
            LengthSnafu {
                text: s.to_owned(),
                len: s.len()
            }
        );
        let bytes = CDID_ENCODING
            .decode(s.as_bytes())
            .context(DecodeSnafu { text: s.to_owned() })?;
        let mut out = [0u8; 16];
        // A 26-symbol input always decodes to 16 bytes
        if bytes.len() != 16 {
            return LengthSnafu {
                text: s.to_owned(),
                len: s.len(),
            }
            .fail();
        }
        out.copy_from_slice(&bytes);
        Ok(Cdid(out))
    }
}

impl Serialize for Cdid {
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cdid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> StdResult<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<Cdid>().map_err(serde::de::Error::custom)
    }
}

/// Parse a prefixed CDID (`t0123...`), checking the prefix
pub fn parse_prefixed(text: &str, prefix: char) -> Result<Cdid> {
    match text.strip_prefix(prefix) {
        Some(rest) => rest.parse::<Cdid>(),
        None => LengthSnafu {
            text: text.to_owned(),
            len: text.len(),
        }
        .fail(),
    }
}

/// Return true if `text` has the shape of a CDID carrying the type prefix `prefix`
pub fn is_seems_cdid(text: &str, prefix: char) -> bool {
    text.len() == CDID_LEN + 1
        && text.starts_with(prefix)
        && text[1..].chars().all(|c| CDID_ALPHABET.contains(c))
}
