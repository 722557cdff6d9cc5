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

//! # concurrent as an HTTP client
//!
//! The node talks to its peers over plain HTTPS: fetching chunks, key chains, timelines &
//! domain descriptions, and pushing items into remote timelines. All of that goes through the
//! [tower] service built by [make_client]:
//!
//! ```text
//!                          requests
//!                              |
//!                              v
//! +---------------    Set User-Agent header    ---------------+
//! | +-------------       overall timeout       -------------+ |
//! | | +-----------       instrumentation       -----------+ | |
//! | | | +---------        Reqwest layer        ---------+ | | |
//! | | | |                                               | | | |
//! | | | |                    remote                     | | | |
//! | | | |                                               | | | |
//! | | | +-------->        Reqwest layer        <--------+ | | |
//! | | +---------->       instrumentation       <----------+ | |
//! | +------------>       overall timeout       <------------+ |
//! +-------------->    Set User-Agent header    <--------------+
//!                              |
//!                              v
//!                          responses
//! ```
//!
//! [tower]: https://docs.rs/tower

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{header::USER_AGENT, HeaderValue};
use opentelemetry::KeyValue;
use pin_project::pin_project;
use snafu::{Backtrace, ResultExt, Snafu};
use tap::Pipe;
use tower::{util::BoxCloneSyncService, BoxError, Layer, Service, ServiceBuilder};
use tower_http::set_header::SetRequestHeaderLayer;
use tracing::{debug, error, Level};

use concurrent_shared::service::ReqwestServiceLayer;

use crate::{
    counter_add,
    metrics::{self, Instruments, Sort},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    ReqwestClient {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{user_agent} is not a legal User-Agent: {source}"))]
    UserAgent {
        user_agent: String,
        source: http::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Outbound connections must be established within this long
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// ...and complete within this long
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The node's outbound HTTP client, type-erased
pub type Client = BoxCloneSyncService<http::Request<Bytes>, http::Response<Bytes>, BoxError>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       InstrumentedService                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("peer.requests", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("peer.errors", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("peer.responses.informational", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("peer.responses.success", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("peer.responses.redirect", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("peer.responses.client_error", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("peer.responses.server_error", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("peer.responses.unknown", Sort::IntegralCounter) }

/// A [Future] wrapping the inner service's future that logs & counts each request
///
/// [Future]: std::future::Future
#[pin_project]
pub struct InstrumentedServiceFuture<InnerFut> {
    host: String,
    span: tracing::Span,
    instruments: Arc<Instruments>,
    #[pin]
    inner: InnerFut,
}

impl<InnerFut> InstrumentedServiceFuture<InnerFut> {
    pub fn new<ReqBody, S>(
        service: &mut S,
        instruments: Arc<Instruments>,
        request: http::Request<ReqBody>,
    ) -> InstrumentedServiceFuture<<S as Service<http::Request<ReqBody>>>::Future>
    where
        S: Service<http::Request<ReqBody>>,
    {
        let host = request.uri().host().unwrap_or("localhost").to_owned();
        let span = tracing::span!(Level::DEBUG, "concurrent-peer-call", host = %host);
        debug!("Sending {} {}", request.method(), request.uri());
        counter_add!(
            instruments,
            "peer.requests",
            1,
            &[KeyValue::new("host", host.clone())]
        );
        InstrumentedServiceFuture {
            host,
            span,
            instruments,
            inner: service.call(request),
        }
    }
}

impl<RspBody, E, InnerFut> std::future::Future for InstrumentedServiceFuture<InnerFut>
where
    InnerFut: std::future::Future<Output = std::result::Result<http::Response<RspBody>, E>>,
    E: std::fmt::Display,
{
    type Output = std::result::Result<http::Response<RspBody>, E>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        let _guard = this.span.enter();
        match this.inner.poll(cx) {
            std::task::Poll::Ready(Ok(rsp)) => {
                let name = match rsp.status().as_u16() {
                    100..=199 => "peer.responses.informational",
                    200..=299 => "peer.responses.success",
                    300..=399 => "peer.responses.redirect",
                    400..=499 => "peer.responses.client_error",
                    500..=599 => "peer.responses.server_error",
                    _ => "peer.responses.unknown",
                };
                counter_add!(
                    this.instruments,
                    name,
                    1,
                    &[KeyValue::new("host", this.host.clone())]
                );
                debug!("{} answered {}", this.host, rsp.status());
                std::task::Poll::Ready(Ok(rsp))
            }
            std::task::Poll::Ready(Err(err)) => {
                error!("While sending a request to {}, got {}", this.host, err);
                counter_add!(
                    this.instruments,
                    "peer.errors",
                    1,
                    &[KeyValue::new("host", this.host.clone())]
                );
                std::task::Poll::Ready(Err(err))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[derive(Clone)]
pub struct InstrumentedService<S> {
    inner: S,
    instruments: Arc<Instruments>,
}

impl<S, ReqBody, RspBody> Service<http::Request<ReqBody>> for InstrumentedService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<RspBody>>,
    S::Error: std::fmt::Display,
{
    type Response = S::Response;

    type Error = S::Error;

    type Future = InstrumentedServiceFuture<S::Future>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        InstrumentedServiceFuture::<S::Future>::new(
            &mut self.inner,
            self.instruments.clone(),
            request,
        )
    }
}

#[derive(Clone)]
pub struct InstrumentedLayer {
    instruments: Arc<Instruments>,
}

impl InstrumentedLayer {
    pub fn new(instruments: Arc<Instruments>) -> InstrumentedLayer {
        InstrumentedLayer { instruments }
    }
}

impl<S> Layer<S> for InstrumentedLayer {
    type Service = InstrumentedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentedService {
            inner,
            instruments: self.instruments.clone(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Build the node's outbound [Client]
///
/// Starting with a [reqwest::Client] carrying the connect & overall timeouts, this sets the
/// User-Agent header, bounds each request by [REQUEST_TIMEOUT] & instruments every request.
pub fn make_client(user_agent: &str, instruments: Arc<Instruments>) -> Result<Client> {
    let reqwest = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context(ReqwestClientSnafu)?;
    ServiceBuilder::new()
        .layer(SetRequestHeaderLayer::overriding(
            USER_AGENT,
            HeaderValue::from_str(user_agent).context(UserAgentSnafu {
                user_agent: user_agent.to_owned(),
            })?,
        ))
        .timeout(REQUEST_TIMEOUT)
        .layer(InstrumentedLayer::new(instruments))
        .layer(ReqwestServiceLayer)
        .service(reqwest)
        .pipe(BoxCloneSyncService::new)
        .pipe(Ok)
}

#[cfg(test)]
mod test {
    use super::*;

    use http::Method;
    use tower::ServiceExt;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn client_smoke_test() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/domain"))
            .and(header("user-agent", "concurrent unit tests/0.0.1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&mock_server)
            .await;

        let mut client = make_client(
            "concurrent unit tests/0.0.1",
            Arc::new(Instruments::new("concurrent-test")),
        )
        .unwrap();

        let request = http::Request::builder()
            .method(Method::GET)
            .uri(format!("{}/api/v1/domain", mock_server.uri()))
            .body(Bytes::default())
            .unwrap();

        let response = client.ready().await.unwrap().call(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"{}");
    }

    #[test]
    fn bad_user_agent() {
        assert!(matches!(
            make_client(
                "bad\nagent",
                Arc::new(Instruments::new("concurrent-test"))
            ),
            Err(Error::UserAgent { .. })
        ));
    }
}
