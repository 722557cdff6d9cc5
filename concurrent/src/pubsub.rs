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

//! # pubsub
//!
//! The message bus over which timeline events fan out to websocket clients. Each timeline has a
//! channel named by its fully-qualified id; the keeper additionally listens on
//! [SUBSCRIPTION_UPDATED] to learn that client subscriptions have changed.

use std::{collections::HashSet, pin::Pin};

use async_trait::async_trait;
use futures_util::{stream, Stream};
use tokio::sync::{mpsc, Mutex};

use crate::cache::Error;

type StdResult<T, E> = std::result::Result<T, E>;

/// Signalled whenever any node's client subscriptions change
pub const SUBSCRIPTION_UPDATED: &str = "concrnt:subscription:updated";

/// A stream of `(channel, payload)` pairs
pub type Subscription = Pin<Box<dyn Stream<Item = (String, String)> + Send>>;

#[async_trait]
pub trait Bus {
    async fn publish(&self, channel: &str, payload: &str) -> StdResult<(), Error>;
    /// Subscribe to `channels`; dropping the returned stream unsubscribes
    async fn subscribe(&self, channels: &[String]) -> StdResult<Subscription, Error>;
}

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<(String, String)>,
}

/// In-process [Bus]
#[derive(Default)]
pub struct LocalBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LocalBus {
    pub fn new() -> LocalBus {
        LocalBus::default()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, payload: &str) -> StdResult<(), Error> {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|sub| !sub.tx.is_closed());
        subscribers
            .iter()
            .filter(|sub| sub.channels.contains(channel))
            .for_each(|sub| {
                // A send can only fail if the receiver went away since we pruned; that's fine
                let _ = sub.tx.send((channel.to_owned(), payload.to_owned()));
            });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> StdResult<Subscription, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(Subscriber {
            channels: channels.iter().cloned().collect(),
            tx,
        });
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use futures_util::StreamExt;

    #[tokio::test]
    async fn fan_out() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe(&["t1@a".to_owned()]).await.unwrap();
        let mut ab = bus
            .subscribe(&["t1@a".to_owned(), "t2@b".to_owned()])
            .await
            .unwrap();
        bus.publish("t2@b", "two").await.unwrap();
        bus.publish("t1@a", "one").await.unwrap();
        assert_eq!(
            a.next().await.unwrap(),
            ("t1@a".to_owned(), "one".to_owned())
        );
        assert_eq!(ab.next().await.unwrap().1, "two");
        assert_eq!(ab.next().await.unwrap().1, "one");
        drop(a);
        bus.publish("t1@a", "again").await.unwrap();
        assert_eq!(bus.subscribers.lock().await.len(), 1);
    }
}
