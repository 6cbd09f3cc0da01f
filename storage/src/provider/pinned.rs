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

use std::sync::Arc;

use async_trait::async_trait;
use coder_client::CoderApi;

use super::{ClientProvider, DefaultNamespaceResolver, EligibleNamespaceLister};
use crate::error::{Error, Result};

/// Serves every request with one configured client, optionally pinned to a
/// single namespace.
pub struct StaticProvider {
    client: Arc<dyn CoderApi>,
    namespace: Option<String>,
}

impl StaticProvider {
    pub fn new(client: Arc<dyn CoderApi>, namespace: Option<String>) -> StaticProvider {
        let namespace = namespace.filter(|namespace| !namespace.is_empty());
        StaticProvider { client, namespace }
    }

    fn pinned(&self) -> Result<&str> {
        self.namespace
            .as_deref()
            .ok_or_else(|| Error::unavailable("no namespace is configured for the backend"))
    }
}

#[async_trait]
impl ClientProvider for StaticProvider {
    async fn client_for_namespace(&self, namespace: &str) -> Result<Arc<dyn CoderApi>> {
        match self.namespace.as_deref() {
            None if namespace.is_empty() => Err(Error::bad_request("a namespace is required")),
            None => Ok(self.client.clone()),
            Some(pinned) if namespace.is_empty() || namespace == pinned => Ok(self.client.clone()),
            Some(pinned) => Err(Error::bad_request(format!(
                "namespace {} not served; configured for {}",
                namespace, pinned
            ))),
        }
    }

    fn default_namespace_resolver(&self) -> Option<&dyn DefaultNamespaceResolver> {
        Some(self)
    }

    fn eligible_namespace_lister(&self) -> Option<&dyn EligibleNamespaceLister> {
        Some(self)
    }
}

#[async_trait]
impl DefaultNamespaceResolver for StaticProvider {
    async fn default_namespace(&self) -> Result<String> {
        self.pinned().map(str::to_string)
    }
}

#[async_trait]
impl EligibleNamespaceLister for StaticProvider {
    async fn eligible_namespaces(&self) -> Result<Vec<String>> {
        self.pinned().map(|namespace| vec![namespace.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCoder;
    use crate::provider::{default_namespace, eligible_namespaces};

    fn provider(namespace: Option<&str>) -> StaticProvider {
        StaticProvider::new(Arc::new(FakeCoder::new()), namespace.map(str::to_string))
    }

    #[tokio::test]
    async fn test_unpinned_serves_any_namespace() {
        let provider = provider(None);
        assert!(provider.client_for_namespace("team-a").await.is_ok());
        assert!(provider.client_for_namespace("team-b").await.is_ok());
        assert_eq!(provider.client_for_namespace("").await.err().map(|err| err.code()), Some(400));

        assert_eq!(default_namespace(&provider).await.unwrap_err().code(), 503);
        assert_eq!(eligible_namespaces(&provider).await.unwrap_err().code(), 503);
    }

    #[tokio::test]
    async fn test_pinned_serves_only_its_namespace() {
        let provider = provider(Some("coder"));
        assert!(provider.client_for_namespace("coder").await.is_ok());
        assert!(provider.client_for_namespace("").await.is_ok());

        let err = provider.client_for_namespace("other").await.err().unwrap();
        assert_eq!(err, Error::BadRequest("namespace other not served; configured for coder".into()));

        assert_eq!(default_namespace(&provider).await.unwrap(), "coder");
        assert_eq!(eligible_namespaces(&provider).await.unwrap(), vec!["coder".to_string()]);
    }

    #[test]
    fn test_empty_pin_is_unpinned() {
        assert!(provider(Some("")).namespace.is_none());
    }
}
