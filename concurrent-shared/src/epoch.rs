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

//! # Chunk epochs
//!
//! Timeline items are bucketed into ten-minute "chunks" for caching purposes. A chunk is named by
//! its "epoch", the Unix time (in seconds) of its lower boundary; a chunk for epoch `E` holds items
//! created in `[E, E + 600)`. On the wire & in cache keys, epochs are rendered as decimal strings.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The width of a chunk, in seconds
pub const CHUNK_SECONDS: i64 = 600;

/// The lower boundary of a ten-minute chunk, in Unix seconds
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Epoch(i64);

impl Epoch {
    /// The epoch containing the Unix time `secs`
    pub fn of_secs(secs: i64) -> Epoch {
        Epoch(secs.div_euclid(CHUNK_SECONDS) * CHUNK_SECONDS)
    }
    /// The epoch containing `t`
    pub fn of(t: &DateTime<Utc>) -> Epoch {
        Epoch::of_secs(t.timestamp())
    }
    /// The epoch containing the present moment
    pub fn current() -> Epoch {
        Epoch::of(&Utc::now())
    }
    pub fn secs(&self) -> i64 {
        self.0
    }
    pub fn prev(&self) -> Epoch {
        Epoch(self.0 - CHUNK_SECONDS)
    }
    pub fn next(&self) -> Epoch {
        Epoch(self.0 + CHUNK_SECONDS)
    }
    /// The (inclusive) start of this chunk
    pub fn start(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
    /// The (exclusive) end of this chunk
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        Epoch::of(t) == *self
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Epoch {
    type Err = std::num::ParseIntError;

    /// Parsing normalizes: "1700000000" yields the epoch 1699999800
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Epoch::of_secs)
    }
}

impl Serialize for Epoch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Epoch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(i64),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse::<Epoch>().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(Epoch::of_secs(n)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn epoch_arithmetic() {
        let e = Epoch::of_secs(1_700_000_000);
        assert_eq!(e.secs(), 1_699_999_800);
        assert_eq!(Epoch::of_secs(e.secs()), e);
        assert_eq!(e.next().secs(), 1_700_000_400);
        assert_eq!(e.prev().secs(), 1_699_999_200);
        assert!(e.contains(&Utc.timestamp_opt(1_700_000_399, 0).unwrap()));
        assert!(!e.contains(&Utc.timestamp_opt(1_700_000_400, 0).unwrap()));
        assert_eq!(e.end(), e.next().start());
    }

    #[test]
    fn epoch_text() {
        let e: Epoch = "1700000000".parse().unwrap();
        assert_eq!(e.to_string(), "1699999800");
        assert_eq!(serde_json::to_string(&e).unwrap(), "\"1699999800\"");
        let f: Epoch = serde_json::from_str("1699999800").unwrap();
        assert_eq!(e, f);
        assert!("ten past".parse::<Epoch>().is_err());
    }
}
