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

//! # concurrent-shared
//!
//! Types shared between the concurrent node and anything that wants to talk to it: identifiers,
//! signatures, the signed document formats, the entities that travel over the wire, and the
//! request & response shapes of the HTTP API.
pub mod api;
pub mod cdid;
pub mod crypto;
pub mod documents;
pub mod entities;
pub mod epoch;
#[cfg(feature = "backend")]
pub mod service;
