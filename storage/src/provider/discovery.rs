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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coder_client::{Client, CoderApi};
use coder_crds::CoderControlPlane;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::debug;
use url::Url;

use super::{ClientProvider, DefaultNamespaceResolver, EligibleNamespaceLister};
use crate::error::{Error, Result};

/// The decoded key/value payload of a secret.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Where backend instance candidates and their credentials come from.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Lists candidates in `namespace`, or in every namespace when `None`.
    async fn list_instances(&self, namespace: Option<&str>) -> Result<Vec<CoderControlPlane>>;

    /// Reads a secret, `None` when it does not exist.
    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;
}

/// Reads control planes and secrets from the cluster.
#[derive(Clone)]
pub struct KubeInstanceSource {
    client: kube::Client,
}

impl KubeInstanceSource {
    pub fn new(client: kube::Client) -> KubeInstanceSource {
        KubeInstanceSource { client }
    }
}

#[async_trait]
impl InstanceSource for KubeInstanceSource {
    async fn list_instances(&self, namespace: Option<&str>) -> Result<Vec<CoderControlPlane>> {
        let api: Api<CoderControlPlane> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };

        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|err| Error::unavailable(format!("failed to list control planes: {}", err)))?;
        Ok(list.items)
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|err| Error::unavailable(format!("failed to read secret {}/{}: {}", namespace, name, err)))?;

        Ok(secret.map(|secret| {
            secret.data.unwrap_or_default().into_iter().map(|(key, value)| (key, value.0)).collect()
        }))
    }
}

/// Discovers the backend from control-plane resources on every call.
///
/// Exactly one eligible instance is served, several eligible instances
/// are refused until requests can be fanned out across them.
pub struct DiscoveryProvider {
    source: Arc<dyn InstanceSource>,
    timeout: Duration,
}

impl DiscoveryProvider {
    pub fn new(source: Arc<dyn InstanceSource>, timeout: Duration) -> DiscoveryProvider {
        DiscoveryProvider { source, timeout }
    }

    async fn eligible(&self, namespace: Option<&str>) -> Result<Vec<CoderControlPlane>> {
        let instances = self.source.list_instances(namespace).await?;
        let total = instances.len();
        let eligible: Vec<_> = instances.into_iter().filter(is_eligible).collect();
        debug!("Found {} eligible of {} control plane candidates", eligible.len(), total);
        Ok(eligible)
    }

    async fn single(&self, namespace: Option<&str>) -> Result<CoderControlPlane> {
        let mut eligible = self.eligible(namespace).await?;
        match eligible.len() {
            0 => Err(Error::unavailable(match namespace {
                Some(namespace) => format!("no eligible instances in namespace {}", namespace),
                None => "no eligible instances".to_string(),
            })),
            1 => Ok(eligible.remove(0)),
            n => Err(Error::bad_request(format!(
                "multiple eligible instances ({}); multi-instance support is planned",
                n
            ))),
        }
    }

    async fn connect(&self, instance: &CoderControlPlane) -> Result<Client> {
        let namespace = instance.namespace().unwrap_or_default();
        let name = instance.name_any();
        let (Some(reference), Some(url)) = (instance.token_secret_ref(), instance.url()) else {
            return Err(Error::unavailable(format!("instance {}/{} is not eligible", namespace, name)));
        };

        let key = reference.key_or_default();
        let data = self.source.read_secret(&namespace, &reference.name).await?.ok_or_else(|| {
            Error::unavailable(format!("secret {}/{} of instance {} not found", namespace, reference.name, name))
        })?;
        let token = data
            .get(key)
            .map(|value| String::from_utf8_lossy(value).trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                Error::unavailable(format!("secret {}/{} has no value for key {}", namespace, reference.name, key))
            })?;

        let base = Url::parse(url)
            .map_err(|err| Error::unavailable(format!("instance {} has an invalid URL {:?}: {}", name, url, err)))?;
        let client = Client::new(base, token, self.timeout)
            .map_err(|err| Error::unavailable(format!("failed to build a client for instance {}: {}", name, err)))?;

        debug!("Resolved instance {}/{} at {}", namespace, name, url);
        Ok(client)
    }
}

fn is_eligible(instance: &CoderControlPlane) -> bool {
    !instance.name_any().contains('.')
        && !instance.access_disabled()
        && instance.ready()
        && instance.token_secret_ref().is_some()
        && instance.url().is_some()
}

#[async_trait]
impl ClientProvider for DiscoveryProvider {
    async fn client_for_namespace(&self, namespace: &str) -> Result<Arc<dyn CoderApi>> {
        let scope = (!namespace.is_empty()).then_some(namespace);
        let instance = self.single(scope).await?;
        Ok(Arc::new(self.connect(&instance).await?))
    }

    fn default_namespace_resolver(&self) -> Option<&dyn DefaultNamespaceResolver> {
        Some(self)
    }

    fn eligible_namespace_lister(&self) -> Option<&dyn EligibleNamespaceLister> {
        Some(self)
    }
}

#[async_trait]
impl DefaultNamespaceResolver for DiscoveryProvider {
    async fn default_namespace(&self) -> Result<String> {
        let instance = self.single(None).await?;
        instance
            .namespace()
            .ok_or_else(|| Error::internal(format!("instance {} has no namespace", instance.name_any())))
    }
}

#[async_trait]
impl EligibleNamespaceLister for DiscoveryProvider {
    async fn eligible_namespaces(&self) -> Result<Vec<String>> {
        let mut namespaces: Vec<String> =
            self.eligible(None).await?.iter().filter_map(|instance| instance.namespace()).collect();
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }
}
