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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The backend answered with a non-success status and its error envelope.
    #[error("{message} (status {status})")]
    Api { status: u16, message: String, detail: String },

    #[error("HTTP Error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("UrlParseError: {0}")]
    UrlParseError(#[source] url::ParseError),

    #[error("InvalidBaseUrl: {0}")]
    InvalidBaseUrl(String),

    #[error("DecodeError: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("response body exceeds {0} bytes")]
    TooLarge(usize),
}

impl Error {
    /// The HTTP status reported by the backend, if the error came from it.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The message of the backend error envelope, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Error::Api { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
