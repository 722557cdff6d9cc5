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

//! Client-side tower Services
//!
//! [tower-http]'s middleware speaks the [http] crate's request & response types, while [reqwest]
//! has its own. This module provides a thin [tower] [Service] wrapping a `reqwest::Client` that
//! translates between the two, so that the node can stack ordinary tower middleware (timeouts,
//! instrumentation, default headers) on top of its outbound HTTP client.
//!
//! Response bodies are collected into [Bytes] before the response is handed back; peers' payloads
//! here are small JSON documents, so there's no call for streaming.
//!
//! [tower-http]: https://docs.rs/tower-http
//! [tower]: https://docs.rs/tower

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use snafu::{Backtrace, IntoError, prelude::*};
use tower::Service;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While waiting for the response body, {source}"))]
    Body {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to convert an http request into a reqwest request: {source}"))]
    Request {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The reqwest service reported an error: {source}"))]
    Reqwest {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("When building an http response, {source}"))]
    Response {
        source: http::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ReqwestService                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn into_http_response(rsp: reqwest::Response) -> Result<http::Response<Bytes>> {
    let builder = rsp.headers().iter().fold(
        http::Response::builder()
            .status(rsp.status())
            .version(rsp.version()),
        |builder, (name, value)| builder.header(name, value),
    );
    builder
        .body(rsp.bytes().await.context(BodySnafu)?)
        .context(ResponseSnafu)
}

/// Wrap a [tower] [Service] speaking [reqwest] so as to produce one that speaks [http]
#[derive(Clone, Debug)]
pub struct ReqwestService<S> {
    inner: S,
}

impl<S> ReqwestService<S> {
    pub fn new(inner: S) -> ReqwestService<S> {
        ReqwestService { inner }
    }
}

pub type ReqwestServiceFuture =
    Pin<Box<dyn Future<Output = Result<http::Response<Bytes>>> + Send + 'static>>;

impl<S, ReqBody> Service<http::Request<ReqBody>> for ReqwestService<S>
where
    ReqBody: Into<reqwest::Body>,
    S: Service<reqwest::Request, Response = reqwest::Response, Error = reqwest::Error>,
    S::Future: Send + 'static,
{
    type Response = http::Response<Bytes>;
    type Error = Error;
    // Naming the composed future isn't worth the trouble; erase it.
    type Future = ReqwestServiceFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<StdResult<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map(|res| res.map_err(|err| ReqwestSnafu.into_error(err)))
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        match reqwest::Request::try_from(req) {
            Ok(req) => {
                let fut = self.inner.call(req);
                Box::pin(async move {
                    let rsp = fut.await.context(ReqwestSnafu)?;
                    into_http_response(rsp).await
                })
            }
            Err(err) => Box::pin(async move { Err(RequestSnafu.into_error(err)) }),
        }
    }
}

/// [tower::Layer] for [ReqwestService]
#[derive(Clone, Debug, Default)]
pub struct ReqwestServiceLayer;

impl<S> tower::Layer<S> for ReqwestServiceLayer {
    type Service = ReqwestService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReqwestService::new(inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tower::{ServiceBuilder, ServiceExt};

    #[tokio::test]
    async fn unroutable_request_fails_cleanly() {
        let mut svc = ServiceBuilder::new()
            .layer(ReqwestServiceLayer)
            .service(reqwest::Client::new());
        let req = http::Request::builder()
            .uri("http://127.0.0.1:1/nothing-here")
            .body(Bytes::new())
            .unwrap();
        let res = ServiceExt::<http::Request<Bytes>>::ready(&mut svc).await.unwrap().call(req).await;
        assert!(matches!(res, Err(Error::Reqwest { .. })));
    }
}
