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

//! # concurrent
//!
//! A node in a federated network of timelines. Accounts sign documents with keys they control;
//! the node verifies & applies them, files the resulting items into time-bucketed chunks, serves
//! those chunks to clients & peers, and pushes new events to websocket subscribers in real time.
//!
//! The library crate holds everything; `concurrentd` just reads configuration & serves.
pub mod api;
pub mod cache;
#[path = "chunk-store.rs"]
pub mod chunk_store;
pub mod client;
pub mod commit;
pub mod concurrent;
pub mod config;
pub mod http;
pub mod keeper;
#[path = "key-chain.rs"]
pub mod key_chain;
pub mod memory;
pub mod metrics;
pub mod peer;
pub mod policy;
pub mod postgres;
pub mod pubsub;
pub mod realtime;
#[path = "redis-store.rs"]
pub mod redis_store;
pub mod storage;
pub mod timeline;
