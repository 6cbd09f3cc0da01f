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
use coder_client::types::{CreateWorkspaceRequest, Workspace, WorkspaceTransition};
use coder_client::CoderApi;
use coder_crds::{CoderWorkspace, CoderWorkspaceSpec};
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::convert;
use crate::error::{Error, Result};
use crate::naming::WorkspaceName;
use crate::options::ListOptions;
use crate::provider::{self, ClientProvider};
use crate::rest::{self, DeleteOutcome, ObjectList, Storage, UpdateFn};
use crate::watch::{Broadcaster, WatchEvent, Watcher, DEFAULT_WATCHER_BUFFER};

pub const RESOURCE: &str = "coderworkspaces";

/// Serves backend workspaces as `CoderWorkspace` objects.
pub struct WorkspaceStore {
    provider: Arc<dyn ClientProvider>,
    events: Broadcaster<CoderWorkspace>,
}

impl WorkspaceStore {
    pub fn new(provider: Arc<dyn ClientProvider>, queue_capacity: usize) -> WorkspaceStore {
        WorkspaceStore { provider, events: Broadcaster::new(queue_capacity, DEFAULT_WATCHER_BUFFER) }
    }

    async fn client(&self, ctx: &RequestContext) -> Result<Arc<dyn CoderApi>> {
        ctx.guard(self.provider.client_for_namespace(&ctx.namespace)).await
    }

    /// Fetches the workspace behind `name`. A workspace of another
    /// organization is reported as not found.
    async fn fetch(
        &self,
        ctx: &RequestContext,
        client: &dyn CoderApi,
        name: &WorkspaceName,
        raw: &str,
    ) -> Result<Workspace> {
        let workspace =
            ctx.backend(RESOURCE, raw, client.workspace_by_owner_and_name(&name.owner, &name.workspace)).await?;
        if workspace.organization_name != name.organization {
            return Err(Error::NotFound { kind: RESOURCE, name: raw.to_string() });
        }
        Ok(workspace)
    }

    /// Resolves a pinned template version, which must belong to `template`.
    async fn pinned_version(
        &self,
        ctx: &RequestContext,
        client: &dyn CoderApi,
        raw: &str,
        pinned: &str,
        template: Uuid,
    ) -> Result<Uuid> {
        let id = Uuid::parse_str(pinned)
            .map_err(|_| Error::bad_request(format!("spec.templateVersionID {:?} is not a valid id", pinned)))?;
        let version = ctx.backend(RESOURCE, raw, client.template_version(id)).await.map_err(|err| match err {
            Error::NotFound { .. } => Error::bad_request(format!("template version {} not found", id)),
            err => err,
        })?;

        if version.template_id != Some(template) {
            return Err(Error::bad_request(format!(
                "template version {} belongs to template {}, not to template {}",
                id,
                version.template_id.map(|id| id.to_string()).unwrap_or_else(|| "<none>".into()),
                template
            )));
        }
        Ok(id)
    }

    async fn transition(
        &self,
        ctx: &RequestContext,
        client: &dyn CoderApi,
        workspace: &Workspace,
        raw: &str,
        transition: WorkspaceTransition,
    ) -> Result<()> {
        ctx.backend(RESOURCE, raw, client.create_workspace_build(workspace.id, &transition.into())).await?;
        info!("Requested {} transition of workspace {}", transition, raw);
        Ok(())
    }
}

/// Reports the first spec field other than `running` that `desired`
/// changes. Absent fields and re-supplied equal values are unchanged.
fn changed_field(current: &CoderWorkspaceSpec, desired: &CoderWorkspaceSpec) -> Option<&'static str> {
    fn differs<T: PartialEq>(desired: &Option<T>, current: &Option<T>) -> bool {
        desired.is_some() && desired != current
    }

    if !desired.organization.is_empty() && desired.organization != current.organization {
        return Some("organization");
    }
    if !desired.template_name.is_empty() && desired.template_name != current.template_name {
        return Some("templateName");
    }
    if differs(&desired.template_version_id, &current.template_version_id) {
        return Some("templateVersionID");
    }
    if differs(&desired.ttl_millis, &current.ttl_millis) {
        return Some("ttlMillis");
    }
    if differs(&desired.autostart_schedule, &current.autostart_schedule) {
        return Some("autostartSchedule");
    }
    None
}

#[async_trait]
impl Storage for WorkspaceStore {
    type Object = CoderWorkspace;

    const RESOURCE: &'static str = RESOURCE;

    async fn get(&self, ctx: &RequestContext, raw: &str) -> Result<CoderWorkspace> {
        let name = WorkspaceName::parse(raw)?;
        let client = self.client(ctx).await?;
        let workspace = self.fetch(ctx, client.as_ref(), &name, raw).await?;
        convert::workspace(&workspace, &ctx.namespace)
    }

    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> Result<ObjectList<CoderWorkspace>> {
        let namespace = match ctx.namespace.as_str() {
            "" => ctx.guard(provider::default_namespace(self.provider.as_ref())).await?,
            namespace => namespace.to_string(),
        };
        let client = ctx.guard(self.provider.client_for_namespace(&namespace)).await?;
        let workspaces = ctx.backend(RESOURCE, "", client.workspaces()).await?;

        let mut items = Vec::with_capacity(workspaces.len());
        for workspace in &workspaces {
            match convert::workspace(workspace, &namespace) {
                Ok(item) => items.push(item),
                Err(err) => warn!("Skipping workspace {}: {}", workspace.id, err),
            }
        }
        rest::into_list(items, options)
    }

    async fn watch(&self, ctx: &RequestContext, options: &ListOptions) -> Result<Watcher<CoderWorkspace>> {
        rest::watch_events(&self.events, ctx, options).await
    }

    async fn create(&self, ctx: &RequestContext, object: CoderWorkspace) -> Result<CoderWorkspace> {
        let raw = rest::validate_create(ctx, &object.metadata)?;
        let name = WorkspaceName::parse(&raw)?;
        let spec = &object.spec;
        if spec.organization != name.organization {
            return Err(Error::bad_request(format!(
                "spec.organization {:?} does not match organization {:?} from metadata.name",
                spec.organization, name.organization
            )));
        }
        if spec.template_name.is_empty() {
            return Err(Error::bad_request("spec.templateName is required"));
        }

        let client = self.client(ctx).await?;
        let organization = ctx.backend(RESOURCE, &raw, client.organization(&name.organization)).await?;
        let template = ctx
            .backend(RESOURCE, &raw, client.template_by_name(&organization.id.to_string(), &spec.template_name))
            .await
            .map_err(|err| match err {
                Error::NotFound { .. } => Error::bad_request(format!(
                    "template {:?} not found in organization {:?}",
                    spec.template_name, organization.name
                )),
                err => err,
            })?;

        let version = match spec.template_version_id.as_deref().filter(|id| !id.is_empty()) {
            Some(pinned) => Some(self.pinned_version(ctx, client.as_ref(), &raw, pinned, template.id).await?),
            None => None,
        };

        let request = CreateWorkspaceRequest {
            name: name.workspace.clone(),
            template_id: version.is_none().then_some(template.id),
            template_version_id: version,
            ttl_ms: spec.ttl_millis,
            autostart_schedule: spec.autostart_schedule.clone(),
        };
        let mut workspace =
            ctx.backend(RESOURCE, &raw, client.create_workspace(organization.id, &name.owner, &request)).await?;
        info!("Created workspace {}", raw);

        // The workspace exists at this point. Failing the request would make
        // a retry run into AlreadyExists, so a failed stop is only logged.
        if !spec.running {
            let stop = WorkspaceTransition::Stop.into();
            match ctx.backend(RESOURCE, &raw, client.create_workspace_build(workspace.id, &stop)).await {
                Ok(build) => workspace.latest_build = build,
                Err(err) => warn!("Created workspace {} but failed to stop it: {}", raw, err),
            }
        }

        let created = convert::workspace(&workspace, &ctx.namespace)?;
        rest::publish(&self.events, WatchEvent::Added(created.clone())).await;
        Ok(created)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        raw: &str,
        update: UpdateFn<CoderWorkspace>,
    ) -> Result<CoderWorkspace> {
        let name = WorkspaceName::parse(raw)?;
        let client = self.client(ctx).await?;
        let workspace = self.fetch(ctx, client.as_ref(), &name, raw).await?;
        let current = convert::workspace(&workspace, &ctx.namespace)?;

        let desired = update(current.clone())?;
        rest::validate_update(RESOURCE, ctx, raw, &current.metadata, &desired.metadata)?;
        if let Some(field) = changed_field(&current.spec, &desired.spec) {
            return Err(Error::bad_request(format!(
                "spec.{} cannot be changed: spec.running is the only mutable field",
                field
            )));
        }
        if desired.spec.running == current.spec.running {
            return Ok(current);
        }

        let transition = if desired.spec.running { WorkspaceTransition::Start } else { WorkspaceTransition::Stop };
        self.transition(ctx, client.as_ref(), &workspace, raw, transition).await?;

        let workspace = self.fetch(ctx, client.as_ref(), &name, raw).await?;
        let updated = convert::workspace(&workspace, &ctx.namespace)?;
        rest::publish(&self.events, WatchEvent::Modified(updated.clone())).await;
        Ok(updated)
    }

    async fn delete(&self, ctx: &RequestContext, raw: &str) -> Result<DeleteOutcome<CoderWorkspace>> {
        let name = WorkspaceName::parse(raw)?;
        let client = self.client(ctx).await?;
        let workspace = self.fetch(ctx, client.as_ref(), &name, raw).await?;

        let request = WorkspaceTransition::Delete.into();
        let build = ctx.backend(RESOURCE, raw, client.create_workspace_build(workspace.id, &request)).await?;
        info!("Requested deletion of workspace {}", raw);

        // Deletion completes asynchronously, the workspace may already be gone.
        let workspace = match self.fetch(ctx, client.as_ref(), &name, raw).await {
            Ok(workspace) => workspace,
            Err(err) if err.is_not_found() => Workspace { latest_build: build, ..workspace },
            Err(err) => return Err(err),
        };

        let object = convert::workspace(&workspace, &ctx.namespace)?;
        rest::publish(&self.events, WatchEvent::Modified(object.clone())).await;
        Ok(DeleteOutcome { object, deleted: false })
    }

    async fn shutdown(&self) {
        self.events.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coder_client::types::{Organization, Template};
    use futures::StreamExt;

    use super::*;
    use crate::fake::FakeCoder;
    use crate::provider::StaticProvider;

    struct Fixture {
        backend: Arc<FakeCoder>,
        store: WorkspaceStore,
        organization: Organization,
        template: Template,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FakeCoder::new());
        let organization = backend.add_organization("acme");
        let template = backend.add_template(&organization, "docker", Vec::new());
        let provider = StaticProvider::new(backend.clone(), Some("coder".into()));
        let store = WorkspaceStore::new(Arc::new(provider), 16);
        Fixture { backend, store, organization, template }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("coder")
    }

    fn workspace(name: &str, running: bool) -> CoderWorkspace {
        CoderWorkspace::new(
            name,
            CoderWorkspaceSpec {
                organization: "acme".into(),
                template_name: "docker".into(),
                running,
                ..Default::default()
            },
        )
    }

    fn set_running(running: bool) -> UpdateFn<CoderWorkspace> {
        Box::new(move |mut object: CoderWorkspace| {
            object.spec.running = running;
            Ok(object)
        })
    }

    async fn next(watcher: &mut Watcher<CoderWorkspace>) -> WatchEvent<CoderWorkspace> {
        tokio::time::timeout(Duration::from_secs(5), watcher.next()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_of_a_stopped_workspace() {
        let f = fixture();
        let mut watcher = f.store.watch(&ctx(), &ListOptions::default()).await.unwrap();

        let created = f.store.create(&ctx(), workspace("acme.alice.dev", false)).await.unwrap();
        assert!(!created.spec.running);
        assert_eq!(created.metadata.namespace.as_deref(), Some("coder"));
        let id = Uuid::parse_str(&created.status.as_ref().unwrap().id).unwrap();
        assert_eq!(f.backend.transitions(), vec![(id, WorkspaceTransition::Stop)]);
        assert!(matches!(next(&mut watcher).await, WatchEvent::Added(object) if !object.spec.running));

        let updated = f.store.update(&ctx(), "acme.alice.dev", set_running(true)).await.unwrap();
        assert!(updated.spec.running);
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);
        assert_eq!(f.backend.transitions().last(), Some(&(id, WorkspaceTransition::Start)));
        assert!(matches!(next(&mut watcher).await, WatchEvent::Modified(object) if object.spec.running));

        let outcome = f.store.delete(&ctx(), "acme.alice.dev").await.unwrap();
        assert!(!outcome.deleted);
        assert_eq!(f.backend.transitions().last(), Some(&(id, WorkspaceTransition::Delete)));
        assert!(matches!(next(&mut watcher).await, WatchEvent::Modified(_)));
    }

    #[tokio::test]
    async fn test_watch_filters_by_namespace_and_selectors() {
        let f = fixture();
        let options = |field: Option<&str>, label: Option<&str>| ListOptions {
            field_selector: field.map(str::to_string),
            label_selector: label.map(str::to_string),
            ..Default::default()
        };
        let mut everywhere = f.store.watch(&RequestContext::new(""), &options(None, None)).await.unwrap();
        let mut elsewhere = f.store.watch(&RequestContext::new("elsewhere"), &options(None, None)).await.unwrap();
        let mut by_name =
            f.store.watch(&ctx(), &options(Some("metadata.name=acme.alice.other"), None)).await.unwrap();
        let mut by_label = f.store.watch(&ctx(), &options(None, Some("team=infra"))).await.unwrap();

        f.store.create(&ctx(), workspace("acme.alice.dev", true)).await.unwrap();
        f.store.create(&ctx(), workspace("acme.alice.other", true)).await.unwrap();

        let first = next(&mut everywhere).await;
        assert_eq!(first.object().metadata.name.as_deref(), Some("acme.alice.dev"));
        assert!(matches!(first, WatchEvent::Added(_)));

        // The name-filtered watcher skipped the first workspace.
        let only = next(&mut by_name).await;
        assert_eq!(only.object().metadata.name.as_deref(), Some("acme.alice.other"));

        for watcher in [&mut elsewhere, &mut by_label] {
            assert!(tokio::time::timeout(Duration::from_millis(100), watcher.next()).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_failed_stop_after_create_is_swallowed() {
        let f = fixture();
        f.backend.fail_transitions(true);

        let created = f.store.create(&ctx(), workspace("acme.alice.dev", false)).await.unwrap();
        assert_eq!(created.metadata.name.as_deref(), Some("acme.alice.dev"));
        assert!(f.backend.transitions().is_empty());

        // A retry reports the conflict rather than a stale failure.
        let err = f.store.create(&ctx(), workspace("acme.alice.dev", false)).await.unwrap_err();
        assert_eq!(err.reason(), "AlreadyExists");
    }

    #[tokio::test]
    async fn test_running_create_issues_no_transition() {
        let f = fixture();
        let created = f.store.create(&ctx(), workspace("acme.alice.dev", true)).await.unwrap();
        assert!(created.spec.running);
        assert!(f.backend.transitions().is_empty());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let f = fixture();

        let err = f.store.create(&ctx(), workspace("acme.dev", true)).await.unwrap_err();
        assert_eq!(err.code(), 400);

        let mut other_org = workspace("acme.alice.dev", true);
        other_org.spec.organization = "globex".into();
        assert_eq!(f.store.create(&ctx(), other_org).await.unwrap_err().code(), 400);

        let mut elsewhere = workspace("acme.alice.dev", true);
        elsewhere.metadata.namespace = Some("other".into());
        assert_eq!(f.store.create(&ctx(), elsewhere).await.unwrap_err().code(), 400);
    }

    #[tokio::test]
    async fn test_create_verifies_pinned_version() {
        let f = fixture();
        let other = f.backend.add_template(&f.organization, "kubernetes", Vec::new());

        let mut foreign = workspace("acme.alice.dev", true);
        foreign.spec.template_version_id = Some(other.active_version_id.to_string());
        let err = f.store.create(&ctx(), foreign).await.unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(err.to_string().contains(&other.active_version_id.to_string()));
        assert!(err.to_string().contains(&f.template.id.to_string()));

        let mut pinned = workspace("acme.alice.dev", true);
        pinned.spec.template_version_id = Some(f.template.active_version_id.to_string());
        let created = f.store.create(&ctx(), pinned).await.unwrap();
        assert_eq!(created.spec.template_version_id, Some(f.template.active_version_id.to_string()));
    }

    #[tokio::test]
    async fn test_get_masks_other_organizations() {
        let f = fixture();
        f.store.create(&ctx(), workspace("acme.alice.dev", true)).await.unwrap();

        assert!(f.store.get(&ctx(), "acme.alice.dev").await.is_ok());
        assert!(f.store.get(&ctx(), "globex.alice.dev").await.unwrap_err().is_not_found());
        assert_eq!(f.store.get(&ctx(), "acme..dev").await.unwrap_err().code(), 400);
    }

    #[tokio::test]
    async fn test_update_concurrency_and_immutability() {
        let f = fixture();
        let created = f.store.create(&ctx(), workspace("acme.alice.dev", true)).await.unwrap();

        let without_version: UpdateFn<CoderWorkspace> = Box::new(|mut object: CoderWorkspace| {
            object.metadata.resource_version = None;
            object.spec.running = false;
            Ok(object)
        });
        let err = f.store.update(&ctx(), "acme.alice.dev", without_version).await.unwrap_err();
        assert_eq!(err.code(), 400);

        let stale: UpdateFn<CoderWorkspace> = Box::new(|mut object: CoderWorkspace| {
            object.metadata.resource_version = Some("1".into());
            object.spec.running = false;
            Ok(object)
        });
        assert_eq!(f.store.update(&ctx(), "acme.alice.dev", stale).await.unwrap_err().code(), 409);

        let retemplate: UpdateFn<CoderWorkspace> = Box::new(|mut object: CoderWorkspace| {
            object.spec.template_name = "kubernetes".into();
            Ok(object)
        });
        let err = f.store.update(&ctx(), "acme.alice.dev", retemplate).await.unwrap_err();
        assert!(err.to_string().contains("spec.running"));

        let resupplied = created.spec.clone();
        let same: UpdateFn<CoderWorkspace> = Box::new(move |mut object: CoderWorkspace| {
            object.spec = resupplied;
            Ok(object)
        });
        let unchanged = f.store.update(&ctx(), "acme.alice.dev", same).await.unwrap();
        assert_eq!(unchanged.metadata.resource_version, created.metadata.resource_version);
        assert!(f.backend.transitions().is_empty());
    }

    #[tokio::test]
    async fn test_list_uses_default_namespace_and_selectors() {
        let f = fixture();
        f.store.create(&ctx(), workspace("acme.alice.dev", true)).await.unwrap();
        f.store.create(&ctx(), workspace("acme.bob.dev", true)).await.unwrap();

        let all = f.store.list(&RequestContext::new(""), &ListOptions::default()).await.unwrap();
        assert_eq!(all.items.len(), 2);
        assert!(all.items.iter().all(|item| item.metadata.namespace.as_deref() == Some("coder")));
        let newest = all
            .items
            .iter()
            .filter_map(|item| item.metadata.resource_version.clone())
            .max_by_key(|version| version.parse::<i128>().unwrap());
        assert_eq!(Some(all.resource_version), newest);

        let options = ListOptions { field_selector: Some("metadata.name=acme.bob.dev".into()), ..Default::default() };
        let bob = f.store.list(&ctx(), &options).await.unwrap();
        assert_eq!(bob.items.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_watches() {
        let f = fixture();
        let mut watcher = f.store.watch(&ctx(), &ListOptions::default()).await.unwrap();
        f.store.shutdown().await;
        f.store.shutdown().await;
        assert!(tokio::time::timeout(Duration::from_secs(5), watcher.next()).await.unwrap().is_none());
    }
}
