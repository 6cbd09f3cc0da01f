// Copyright 2024 The Coder Aggregator Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusDetails};
use thiserror::Error;

/// The error taxonomy of the cluster resource API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Operation cannot be fulfilled on {kind} \"{name}\": {message}")]
    Conflict { kind: &'static str, name: String, message: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("{kind} \"{name}\" is forbidden: {message}")]
    Forbidden { kind: &'static str, name: String, message: String },

    #[error("{0}")]
    Unauthorized(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Timeout(String),

    #[error("Internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Error {
        Error::BadRequest(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Error {
        Error::ServiceUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Error {
        Error::Internal(message.into())
    }

    /// The HTTP status code the error is served with.
    pub fn code(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::AlreadyExists { .. } | Error::Conflict { .. } => 409,
            Error::BadRequest(_) => 400,
            Error::Forbidden { .. } => 403,
            Error::Unauthorized(_) => 401,
            Error::TooManyRequests(_) => 429,
            Error::ServiceUnavailable(_) => 503,
            Error::Timeout(_) => 504,
            Error::Internal(_) => 500,
        }
    }

    /// The machine readable reason of the Status object.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::Conflict { .. } => "Conflict",
            Error::BadRequest(_) => "BadRequest",
            Error::Forbidden { .. } => "Forbidden",
            Error::Unauthorized(_) => "Unauthorized",
            Error::TooManyRequests(_) => "TooManyRequests",
            Error::ServiceUnavailable(_) => "ServiceUnavailable",
            Error::Timeout(_) => "Timeout",
            Error::Internal(_) => "InternalError",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Renders the error as a `metav1.Status` failure.
    pub fn to_status(&self) -> Status {
        let details = match self {
            Error::NotFound { kind, name }
            | Error::AlreadyExists { kind, name }
            | Error::Conflict { kind, name, .. }
            | Error::Forbidden { kind, name, .. } => Some(StatusDetails {
                group: Some(coder_crds::GROUP.to_string()),
                kind: Some(kind.to_string()),
                name: Some(name.clone()),
                ..StatusDetails::default()
            }),
            _ => None,
        };

        Status {
            status: Some("Failure".into()),
            code: Some(i32::from(self.code())),
            reason: Some(self.reason().into()),
            message: Some(self.to_string()),
            details,
            ..Status::default()
        }
    }
}

/// Translates a backend failure into the cluster error taxonomy.
///
/// Errors that carry no backend status (transport, decoding) are internal.
pub fn map_backend_error(err: &coder_client::Error, kind: &'static str, name: &str) -> Error {
    let Some(status) = err.status() else {
        return Error::Internal(err.to_string());
    };
    let message = err.message().filter(|message| !message.is_empty()).map(str::to_string);
    let message_or_error = || message.clone().unwrap_or_else(|| err.to_string());

    match status {
        404 => Error::NotFound { kind, name: name.to_string() },
        403 => Error::Forbidden { kind, name: name.to_string(), message: message_or_error() },
        409 => {
            if message_or_error().to_lowercase().contains("already exists") {
                Error::AlreadyExists { kind, name: name.to_string() }
            } else {
                Error::Conflict { kind, name: name.to_string(), message: message_or_error() }
            }
        }
        400 | 422 => Error::BadRequest(message_or_error()),
        401 => Error::Unauthorized(message_or_error()),
        429 => Error::TooManyRequests(message_or_error()),
        400..=499 => Error::BadRequest(message_or_error()),
        _ => Error::Internal(err.to_string()),
    }
}
