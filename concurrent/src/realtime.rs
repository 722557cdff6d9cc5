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

//! # Realtime client connections
//!
//! Clients open a websocket at `/api/v1/timelines/realtime` & send
//! `{"type":"listen","channels":[…]}` to say which timelines they want to follow; each listen frame
//! replaces the connection's previous set. Events on those timelines are forwarded as JSON text
//! frames, and a `{"type":"heartbeat"}` frame goes out every ten seconds.
//!
//! Subscriptions to remote timelines are the [keeper](crate::keeper)'s concern: each connection
//! registers its channels there & announces the change on [SUBSCRIPTION_UPDATED].

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{stream, SinkExt, StreamExt};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use concurrent_shared::api::RealtimeFrame;

use crate::{
    concurrent::Concurrent,
    counter_add,
    metrics::{self, Sort},
    pubsub::{Subscription, SUBSCRIPTION_UPDATED},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to encode a frame: {source}"))]
    Encode {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While reading from the client: {source}"))]
    Receive {
        source: axum::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While writing to the client: {source}"))]
    Send {
        source: axum::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

inventory::submit! { metrics::Registration::new("realtime.connections", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("realtime.events.forwarded", Sort::IntegralCounter) }

/// Upgrade to a realtime websocket
pub async fn realtime(State(state): State<Arc<Concurrent>>, ws: WebSocketUpgrade) -> Response {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    counter_add!(state.instruments, "realtime.connections", 1, &[]);
    ws.on_upgrade(move |socket| async move {
        debug!("Realtime connection {connection} opened");
        if let Err(err) = serve_client(socket, state.clone(), connection).await {
            warn!("Realtime connection {connection}: {err}");
        }
        state.keeper.unregister(connection);
        announce(&state, connection).await;
        debug!("Realtime connection {connection} closed");
    })
}

/// Let every keeper listening know that subscriptions changed
async fn announce(state: &Concurrent, connection: u64) {
    if let Err(err) = state
        .bus
        .publish(SUBSCRIPTION_UPDATED, &connection.to_string())
        .await
    {
        warn!("Failed to announce a subscription change: {err}");
    }
}

async fn serve_client(socket: WebSocket, state: Arc<Concurrent>, connection: u64) -> Result<()> {
    let (mut sink, mut frames) = socket.split();
    let mut events: Subscription = Box::pin(stream::pending::<(String, String)>());
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let beat = serde_json::to_string(&RealtimeFrame::Heartbeat).context(EncodeSnafu)?;

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(err)) => return Err(err).context(ReceiveSnafu),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RealtimeFrame>(text.as_str()) {
                        Ok(RealtimeFrame::Listen { channels }) => {
                            events = listen(&state, connection, channels).await;
                        }
                        Ok(RealtimeFrame::Heartbeat) => (),
                        Err(err) => debug!("Ignoring an unintelligible frame ({err}): {}", text.as_str()),
                    }
                }
                // Pings are answered by axum
                Some(Ok(_)) => (),
            },
            event = events.next() => match event {
                Some((_, payload)) => {
                    sink.send(Message::Text(payload.into())).await.context(SendSnafu)?;
                    counter_add!(state.instruments, "realtime.events.forwarded", 1, &[]);
                }
                None => {
                    warn!("Realtime connection {connection}: the event stream ended");
                    events = Box::pin(stream::pending::<(String, String)>());
                }
            },
            _ = heartbeat.tick() => {
                sink.send(Message::Text(beat.clone().into())).await.context(SendSnafu)?;
            }
        }
    }
}

/// Replace `connection`'s subscriptions with `channels`
async fn listen(state: &Concurrent, connection: u64, channels: Vec<String>) -> Subscription {
    let mut normalized = Vec::with_capacity(channels.len());
    for channel in &channels {
        match state.timelines.normalize_timeline_id(channel).await {
            Ok(timeline) => normalized.push(timeline),
            Err(err) => info!("Connection {connection} can't listen to {channel}: {err}"),
        }
    }
    normalized.sort();
    normalized.dedup();
    let events = match state.bus.subscribe(&normalized).await {
        Ok(events) => events,
        Err(err) => {
            warn!("Failed to subscribe to {normalized:?}: {err}");
            Box::pin(stream::pending::<(String, String)>())
        }
    };
    state.keeper.register(connection, normalized);
    announce(state, connection).await;
    events
}
