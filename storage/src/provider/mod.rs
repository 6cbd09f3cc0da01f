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

//! Resolution of the backend client serving a request namespace.

use std::sync::Arc;

use async_trait::async_trait;
use coder_client::CoderApi;

use crate::error::{Error, Result};

mod discovery;
mod pinned;

pub use discovery::{DiscoveryProvider, InstanceSource, KubeInstanceSource, SecretData};
pub use pinned::StaticProvider;

/// Yields the backend client for a request namespace.
///
/// Optional capabilities are exposed as separate extension traits, probed
/// through the accessor methods. Providers only opt into what they support.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client_for_namespace(&self, namespace: &str) -> Result<Arc<dyn CoderApi>>;

    fn default_namespace_resolver(&self) -> Option<&dyn DefaultNamespaceResolver> {
        None
    }

    fn eligible_namespace_lister(&self) -> Option<&dyn EligibleNamespaceLister> {
        None
    }
}

/// Resolves the namespace used for responses to namespace-unscoped requests.
#[async_trait]
pub trait DefaultNamespaceResolver: Send + Sync {
    async fn default_namespace(&self) -> Result<String>;
}

/// Enumerates every namespace the provider can serve.
#[async_trait]
pub trait EligibleNamespaceLister: Send + Sync {
    async fn eligible_namespaces(&self) -> Result<Vec<String>>;
}

pub async fn default_namespace(provider: &dyn ClientProvider) -> Result<String> {
    match provider.default_namespace_resolver() {
        Some(resolver) => resolver.default_namespace().await,
        None => Err(Error::unavailable("the client provider cannot resolve a default namespace")),
    }
}

pub async fn eligible_namespaces(provider: &dyn ClientProvider) -> Result<Vec<String>> {
    match provider.eligible_namespace_lister() {
        Some(lister) => lister.eligible_namespaces().await,
        None => Err(Error::unavailable("the client provider cannot enumerate namespaces")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait]
    impl ClientProvider for Bare {
        async fn client_for_namespace(&self, _namespace: &str) -> Result<Arc<dyn CoderApi>> {
            Err(Error::unavailable("unused"))
        }
    }

    #[tokio::test]
    async fn test_missing_capabilities_are_unavailable() {
        assert_eq!(default_namespace(&Bare).await.unwrap_err().code(), 503);
        assert_eq!(eligible_namespaces(&Bare).await.unwrap_err().code(), 503);
    }
}
