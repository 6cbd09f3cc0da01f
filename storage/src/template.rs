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

use async_trait::async_trait;
use coder_client::types::{
    CreateTemplateRequest, CreateTemplateVersionRequest, Template, UpdateActiveTemplateVersion, UpdateTemplateMeta,
};
use coder_client::{CoderApi, ARCHIVE_FORMAT_ZIP};
use coder_crds::{CoderTemplate, CoderTemplateSpec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::convert;
use crate::error::{Error, Result};
use crate::naming::TemplateName;
use crate::options::ListOptions;
use crate::provider::{self, ClientProvider};
use crate::rest::{self, DeleteOutcome, ObjectList, Storage, UpdateFn};
use crate::source::{self, SourceArchive};
use crate::watch::{Broadcaster, WatchEvent, Watcher, DEFAULT_WATCHER_BUFFER};

pub const RESOURCE: &str = "codertemplates";

/// Serves backend templates as `CoderTemplate` objects, including the
/// text sources of their active version.
pub struct TemplateStore {
    provider: Arc<dyn ClientProvider>,
    events: Broadcaster<CoderTemplate>,
}

impl TemplateStore {
    pub fn new(provider: Arc<dyn ClientProvider>, queue_capacity: usize) -> TemplateStore {
        TemplateStore { provider, events: Broadcaster::new(queue_capacity, DEFAULT_WATCHER_BUFFER) }
    }

    async fn client(&self, ctx: &RequestContext) -> Result<Arc<dyn CoderApi>> {
        ctx.guard(self.provider.client_for_namespace(&ctx.namespace)).await
    }

    async fn fetch(&self, ctx: &RequestContext, client: &dyn CoderApi, name: &TemplateName, raw: &str) -> Result<Template> {
        let template =
            ctx.backend(RESOURCE, raw, client.template_by_name(&name.organization, &name.template)).await?;
        if template.organization_name != name.organization {
            return Err(Error::NotFound { kind: RESOURCE, name: raw.to_string() });
        }
        Ok(template)
    }

    /// Downloads and extracts the source archive of the active version.
    async fn sources(
        &self,
        ctx: &RequestContext,
        client: &dyn CoderApi,
        template: &Template,
        raw: &str,
    ) -> Result<SourceArchive> {
        let version = ctx.backend(RESOURCE, raw, client.template_version(template.active_version_id)).await?;
        let archive =
            ctx.backend(RESOURCE, raw, client.download(version.job.file_id, ARCHIVE_FORMAT_ZIP)).await?;
        debug!("Downloaded {} bytes of sources for template {}", archive.len(), raw);

        SourceArchive::extract(archive).map_err(|err| {
            Error::internal(format!("source archive of template version {} is unusable: {}", version.id, err))
        })
    }

    /// Fetches a version named by the caller, which must belong to `owner`.
    async fn version(
        &self,
        ctx: &RequestContext,
        client: &dyn CoderApi,
        raw: &str,
        version: &str,
        owner: impl Fn(&coder_client::types::TemplateVersion) -> bool,
        owner_description: &str,
    ) -> Result<Uuid> {
        let id = Uuid::parse_str(version)
            .map_err(|_| Error::bad_request(format!("spec.versionID {:?} is not a valid id", version)))?;
        let found = ctx.backend(RESOURCE, raw, client.template_version(id)).await.map_err(|err| match err {
            Error::NotFound { .. } => Error::bad_request(format!("template version {} not found", id)),
            err => err,
        })?;
        if !owner(&found) {
            return Err(Error::bad_request(format!("template version {} does not belong to {}", id, owner_description)));
        }
        Ok(id)
    }

    /// Uploads a packed source archive and records it as a new version.
    async fn publish_sources(
        &self,
        ctx: &RequestContext,
        client: &dyn CoderApi,
        raw: &str,
        organization: Uuid,
        template: Option<Uuid>,
        archive: Vec<u8>,
    ) -> Result<Uuid> {
        let file_id = ctx.backend(RESOURCE, raw, client.upload(archive)).await?;

        let request = CreateTemplateVersionRequest::from_file(file_id, template, format!("Sources of {}", raw));
        let version = ctx.backend(RESOURCE, raw, client.create_template_version(organization, &request)).await?;
        info!("Created version {} of template {}", version.id, raw);
        Ok(version.id)
    }
}

/// The metadata patch turning `current` into `desired`, `None` when they agree.
fn metadata_patch(current: &CoderTemplateSpec, desired: &CoderTemplateSpec) -> Option<UpdateTemplateMeta> {
    let changed = |desired: &String, current: &String| (desired != current).then(|| desired.clone());
    let patch = UpdateTemplateMeta {
        display_name: changed(&desired.display_name, &current.display_name),
        description: changed(&desired.description, &current.description),
        icon: changed(&desired.icon, &current.icon),
    };
    (patch != UpdateTemplateMeta::default()).then_some(patch)
}

#[async_trait]
impl Storage for TemplateStore {
    type Object = CoderTemplate;

    const RESOURCE: &'static str = RESOURCE;

    async fn get(&self, ctx: &RequestContext, raw: &str) -> Result<CoderTemplate> {
        let name = TemplateName::parse(raw)?;
        let client = self.client(ctx).await?;
        let template = self.fetch(ctx, client.as_ref(), &name, raw).await?;
        let sources = self.sources(ctx, client.as_ref(), &template, raw).await?;
        convert::template(&template, &ctx.namespace, Some(sources.files()))
    }

    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> Result<ObjectList<CoderTemplate>> {
        let namespace = match ctx.namespace.as_str() {
            "" => ctx.guard(provider::default_namespace(self.provider.as_ref())).await?,
            namespace => namespace.to_string(),
        };
        let client = ctx.guard(self.provider.client_for_namespace(&namespace)).await?;
        let templates = ctx.backend(RESOURCE, "", client.templates()).await?;

        let mut items = Vec::with_capacity(templates.len());
        for template in &templates {
            match convert::template(template, &namespace, None) {
                Ok(item) => items.push(item),
                Err(err) => warn!("Skipping template {}: {}", template.id, err),
            }
        }
        rest::into_list(items, options)
    }

    async fn watch(&self, ctx: &RequestContext, options: &ListOptions) -> Result<Watcher<CoderTemplate>> {
        rest::watch_events(&self.events, ctx, options).await
    }

    async fn create(&self, ctx: &RequestContext, object: CoderTemplate) -> Result<CoderTemplate> {
        let raw = rest::validate_create(ctx, &object.metadata)?;
        let name = TemplateName::parse(&raw)?;
        let spec = &object.spec;
        if spec.organization != name.organization {
            return Err(Error::bad_request(format!(
                "spec.organization {:?} does not match organization {:?} from metadata.name",
                spec.organization, name.organization
            )));
        }
        let pinned = spec.version_id.as_deref().filter(|id| !id.is_empty());
        if pinned.is_some() && spec.files.is_some() {
            return Err(Error::bad_request("spec.versionID and spec.files are mutually exclusive"));
        }

        let client = self.client(ctx).await?;
        let organization = ctx.backend(RESOURCE, &raw, client.organization(&name.organization)).await?;

        let (version, files) = match (pinned, spec.files.as_ref()) {
            (Some(pinned), _) => {
                let belongs = |version: &coder_client::types::TemplateVersion| {
                    version.organization_id.map_or(true, |id| id == organization.id)
                };
                let description = format!("organization {}", organization.name);
                (self.version(ctx, client.as_ref(), &raw, pinned, belongs, &description).await?, None)
            }
            (None, Some(files)) => {
                let files = source::normalize_files(files)?;
                let archive = SourceArchive::default().rebuild(&files)?;
                let version =
                    self.publish_sources(ctx, client.as_ref(), &raw, organization.id, None, archive).await?;
                (version, Some(files))
            }
            (None, None) => return Err(Error::bad_request("either spec.versionID or spec.files is required")),
        };

        let request = CreateTemplateRequest {
            name: name.template.clone(),
            display_name: spec.display_name.clone(),
            description: spec.description.clone(),
            icon: spec.icon.clone(),
            template_version_id: version,
        };
        let template = ctx.backend(RESOURCE, &raw, client.create_template(organization.id, &request)).await?;
        info!("Created template {}", raw);

        let created = convert::template(&template, &ctx.namespace, files)?;
        rest::publish(&self.events, WatchEvent::Added(created.clone())).await;
        Ok(created)
    }

    async fn update(&self, ctx: &RequestContext, raw: &str, update: UpdateFn<CoderTemplate>) -> Result<CoderTemplate> {
        let name = TemplateName::parse(raw)?;
        let client = self.client(ctx).await?;
        let template = self.fetch(ctx, client.as_ref(), &name, raw).await?;
        let sources = self.sources(ctx, client.as_ref(), &template, raw).await?;
        let current = convert::template(&template, &ctx.namespace, Some(sources.files()))?;

        let desired = update(current.clone())?;
        rest::validate_update(RESOURCE, ctx, raw, &current.metadata, &desired.metadata)?;
        if !desired.spec.organization.is_empty() && desired.spec.organization != current.spec.organization {
            return Err(Error::bad_request("spec.organization cannot be changed"));
        }

        let promote = desired
            .spec
            .version_id
            .as_deref()
            .filter(|id| !id.is_empty() && *id != template.active_version_id.to_string());
        let files = match desired.spec.files.as_ref() {
            Some(files) => Some(source::normalize_files(files)?).filter(|files| sources.differs(files)),
            None => None,
        };
        if promote.is_some() && files.is_some() {
            return Err(Error::bad_request("spec.versionID and spec.files cannot change in the same update"));
        }
        let patch = metadata_patch(&current.spec, &desired.spec);

        if patch.is_none() && promote.is_none() && files.is_none() {
            return Ok(current);
        }

        // Everything that can reject the update runs before the first mutation.
        let promoted = match promote {
            Some(version) => {
                let belongs = |version: &coder_client::types::TemplateVersion| version.template_id == Some(template.id);
                let description = format!("template {}", raw);
                Some(self.version(ctx, client.as_ref(), raw, version, belongs, &description).await?)
            }
            None => None,
        };
        let archive = match files.as_ref() {
            Some(files) => Some(sources.rebuild(files)?),
            None => None,
        };

        if let Some(patch) = patch {
            ctx.backend(RESOURCE, raw, client.update_template_meta(template.id, &patch)).await?;
            info!("Updated metadata of template {}", raw);
        }

        let activate = match (promoted, archive) {
            (Some(version), _) => Some(version),
            (None, Some(archive)) => Some(
                self.publish_sources(ctx, client.as_ref(), raw, template.organization_id, Some(template.id), archive)
                    .await?,
            ),
            (None, None) => None,
        };
        if let Some(version) = activate {
            let request = UpdateActiveTemplateVersion { id: version };
            ctx.backend(RESOURCE, raw, client.update_active_template_version(template.id, &request)).await?;
            info!("Activated version {} of template {}", version, raw);
        }

        let template = ctx.backend(RESOURCE, raw, client.template(template.id)).await?;
        let sources = self.sources(ctx, client.as_ref(), &template, raw).await?;
        let updated = convert::template(&template, &ctx.namespace, Some(sources.files()))?;
        rest::publish(&self.events, WatchEvent::Modified(updated.clone())).await;
        Ok(updated)
    }

    async fn delete(&self, ctx: &RequestContext, raw: &str) -> Result<DeleteOutcome<CoderTemplate>> {
        let name = TemplateName::parse(raw)?;
        let client = self.client(ctx).await?;
        let template = self.fetch(ctx, client.as_ref(), &name, raw).await?;

        ctx.backend(RESOURCE, raw, client.delete_template(template.id)).await?;
        info!("Deleted template {}", raw);

        let object = convert::template(&template, &ctx.namespace, None)?;
        rest::publish(&self.events, WatchEvent::Deleted(object.clone())).await;
        Ok(DeleteOutcome { object, deleted: true })
    }

    async fn shutdown(&self) {
        self.events.shutdown().await;
    }
}
