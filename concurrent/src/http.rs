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

//! HTTP plumbing shared by all the handlers

use axum::{response::IntoResponse, Json};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use concurrent_shared::api::Envelope;

/// A serializable struct for use in HTTP error responses
///
/// `error` names the kind of failure (`BadRequest`, `AuthenticationFailed`, ...); `message` carries
/// the detail. Every handler's error type converts itself into one of these.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Wrap `content` in the standard success envelope
pub fn ok<T: Serialize>(content: T) -> axum::response::Response {
    (StatusCode::OK, Json(Envelope::ok(content))).into_response()
}

/// Build an error response with status `code`
pub fn error_response(code: StatusCode, kind: &str, message: String) -> axum::response::Response {
    (
        code,
        ErrorResponseBody {
            error: kind.to_owned(),
            message,
        },
    )
        .into_response()
}

/// The name of the error kind conventionally paired with `code`
pub fn kind_for_status(code: StatusCode) -> &'static str {
    match code {
        StatusCode::BAD_REQUEST => "BadRequest",
        StatusCode::UNAUTHORIZED => "AuthenticationFailed",
        StatusCode::FORBIDDEN => "AuthorisationFailed",
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::CONFLICT => "Conflict",
        StatusCode::BAD_GATEWAY => "Upstream",
        _ => "Internal",
    }
}
