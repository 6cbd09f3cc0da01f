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

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{map_backend_error, Error, Result};

/// Per-request state handed to every storage operation.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// The namespace of the request path, empty for cluster-wide requests.
    pub namespace: String,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(namespace: impl Into<String>) -> RequestContext {
        RequestContext { namespace: namespace.into(), cancel: CancellationToken::new() }
    }

    pub fn with_cancellation(namespace: impl Into<String>, cancel: CancellationToken) -> RequestContext {
        RequestContext { namespace: namespace.into(), cancel }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs a backend round-trip, aborting it once the request is cancelled.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Timeout("request was cancelled before the backend answered".into())),
            result = fut => result,
        }
    }

    /// Runs a backend call under [`guard`](Self::guard), mapping its failure
    /// onto the resource named `name`.
    pub async fn backend<F, T>(&self, kind: &'static str, name: &str, call: F) -> Result<T>
    where
        F: Future<Output = coder_client::Result<T>>,
    {
        self.guard(async move { call.await.map_err(|err| map_backend_error(&err, kind, name)) }).await
    }
}
