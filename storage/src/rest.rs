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

//! The storage contract served for every resource kind.

use async_trait::async_trait;
use kube::core::ObjectMeta;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::context::RequestContext;
use crate::convert::latest_resource_version;
use crate::error::{Error, Result};
use crate::options::{ListOptions, Predicate};
use crate::watch::{Broadcaster, Filter, WatchEvent, Watcher};

/// Produces the desired object from the current one.
pub type UpdateFn<K> = Box<dyn FnOnce(K) -> Result<K> + Send>;

/// The items of a list together with the collection's resource version.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList<K> {
    pub resource_version: String,
    pub items: Vec<K>,
}

/// The outcome of a delete. `deleted` is false when the backend only
/// accepted the request and removes the object later.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOutcome<K> {
    pub object: K,
    pub deleted: bool,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Object: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The plural resource name, used in paths and error messages.
    const RESOURCE: &'static str;

    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Self::Object>;
    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> Result<ObjectList<Self::Object>>;
    async fn watch(&self, ctx: &RequestContext, options: &ListOptions) -> Result<Watcher<Self::Object>>;
    async fn create(&self, ctx: &RequestContext, object: Self::Object) -> Result<Self::Object>;
    async fn update(&self, ctx: &RequestContext, name: &str, update: UpdateFn<Self::Object>) -> Result<Self::Object>;
    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<DeleteOutcome<Self::Object>>;

    /// Stops the watch machinery. Calling it again is a no-op.
    async fn shutdown(&self);
}

/// Checks the identity of an object submitted for creation and returns its
/// name.
pub(crate) fn validate_create(ctx: &RequestContext, meta: &ObjectMeta) -> Result<String> {
    let name = meta.name.clone().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::bad_request("metadata.name is required"));
    }
    check_namespace(ctx, meta)?;
    Ok(name)
}

/// Checks the identity and the resource version of the desired object of an
/// update against the request path and the current object.
pub(crate) fn validate_update(
    kind: &'static str,
    ctx: &RequestContext,
    name: &str,
    current: &ObjectMeta,
    desired: &ObjectMeta,
) -> Result<()> {
    if desired.name.as_deref().unwrap_or_default() != name {
        return Err(Error::bad_request(format!(
            "metadata.name {:?} does not match the name {:?} in the request path",
            desired.name.as_deref().unwrap_or_default(),
            name
        )));
    }
    check_namespace(ctx, desired)?;

    let got = desired.resource_version.as_deref().unwrap_or_default();
    if got.is_empty() {
        return Err(Error::bad_request("resourceVersion is required"));
    }
    let latest = current.resource_version.as_deref().unwrap_or_default();
    if got != latest {
        return Err(Error::Conflict {
            kind,
            name: name.to_string(),
            message: format!("resource version mismatch: got {}, current is {}", got, latest),
        });
    }
    Ok(())
}

/// Applies the list selectors and stamps the collection's resource version.
pub(crate) fn into_list<K: Resource>(items: Vec<K>, options: &ListOptions) -> Result<ObjectList<K>> {
    let predicate = Predicate::from_options(options)?;
    let items: Vec<K> = items.into_iter().filter(|item| predicate.matches(item)).collect();
    let resource_version = latest_resource_version(items.iter().map(|item| item.meta().resource_version.as_ref()));
    Ok(ObjectList { resource_version, items })
}

/// Subscribes to the events of `broadcaster` matching the request namespace
/// and the selectors of `options`.
pub(crate) async fn watch_events<K>(
    broadcaster: &Broadcaster<K>,
    ctx: &RequestContext,
    options: &ListOptions,
) -> Result<Watcher<K>>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    options.validate_watch()?;
    let predicate = Predicate::from_options(options)?;
    let namespace = ctx.namespace.clone();
    let filter: Filter<K> = Box::new(move |object: &K| {
        (namespace.is_empty() || object.meta().namespace.as_deref() == Some(namespace.as_str()))
            && predicate.matches(object)
    });
    broadcaster.watch(filter, ctx.cancellation().clone(), options.timeout()).await
}

/// Enqueues an event for the watchers. A closed queue only happens during
/// shutdown and never fails the mutation that already succeeded.
pub(crate) async fn publish<K>(broadcaster: &Broadcaster<K>, event: WatchEvent<K>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let name = event.object().meta().name.clone().unwrap_or_default();
    if let Err(err) = broadcaster.emit(event).await {
        warn!("Dropped watch event for {}: {}", name, err);
    }
}

fn check_namespace(ctx: &RequestContext, meta: &ObjectMeta) -> Result<()> {
    match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() && namespace != ctx.namespace => Err(Error::bad_request(format!(
            "metadata.namespace {:?} does not match the namespace {:?} of the request",
            namespace, ctx.namespace
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, namespace: Option<&str>, resource_version: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: namespace.map(str::to_string),
            resource_version: resource_version.map(str::to_string),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn test_validate_create() {
        let ctx = RequestContext::new("coder");
        assert_eq!(validate_create(&ctx, &meta("acme.docker", None, None)).unwrap(), "acme.docker");
        assert_eq!(validate_create(&ctx, &meta("acme.docker", Some("coder"), None)).unwrap(), "acme.docker");
        assert!(validate_create(&ctx, &meta("", None, None)).is_err());
        assert!(validate_create(&ctx, &meta("acme.docker", Some("other"), None)).is_err());
    }

    #[test]
    fn test_validate_update_resource_version() {
        let ctx = RequestContext::new("coder");
        let current = meta("acme.docker", Some("coder"), Some("10"));

        let missing = validate_update("codertemplates", &ctx, "acme.docker", &current, &meta("acme.docker", None, None));
        assert_eq!(missing.unwrap_err(), Error::BadRequest("resourceVersion is required".into()));

        let stale =
            validate_update("codertemplates", &ctx, "acme.docker", &current, &meta("acme.docker", None, Some("9")));
        let err = stale.unwrap_err();
        assert_eq!(err.code(), 409);
        assert!(err.to_string().contains("resource version mismatch: got 9, current is 10"));

        assert!(validate_update("codertemplates", &ctx, "acme.docker", &current, &current).is_ok());
    }

    #[test]
    fn test_validate_update_identity() {
        let ctx = RequestContext::new("coder");
        let current = meta("acme.docker", Some("coder"), Some("10"));

        let renamed = meta("acme.other", Some("coder"), Some("10"));
        assert!(validate_update("codertemplates", &ctx, "acme.docker", &current, &renamed).is_err());

        let moved = meta("acme.docker", Some("elsewhere"), Some("10"));
        assert!(validate_update("codertemplates", &ctx, "acme.docker", &current, &moved).is_err());
    }
}
