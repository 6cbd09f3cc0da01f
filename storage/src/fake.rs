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

//! An in-memory backend for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use coder_client::types::*;
use coder_client::{CoderApi, Error, Result};
use uuid::Uuid;

#[derive(Default)]
struct State {
    clock: i64,
    organizations: Vec<Organization>,
    templates: Vec<Template>,
    versions: Vec<TemplateVersion>,
    files: HashMap<Uuid, Vec<u8>>,
    workspaces: Vec<Workspace>,
    uploads: usize,
    versions_created: usize,
    transitions: Vec<(Uuid, WorkspaceTransition)>,
    fail_transitions: bool,
}

impl State {
    /// Every mutation observes a strictly later timestamp.
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default() + Duration::milliseconds(self.clock)
    }

    fn organization(&self, organization: &str) -> Result<Organization> {
        self.organizations
            .iter()
            .find(|org| org.name == organization || org.id.to_string() == organization)
            .cloned()
            .ok_or_else(|| not_found("organization"))
    }

    fn organization_by_id(&self, id: Uuid) -> Result<Organization> {
        self.organization(&id.to_string())
    }

    fn template_mut(&mut self, id: Uuid) -> Result<&mut Template> {
        self.templates.iter_mut().find(|template| template.id == id).ok_or_else(|| not_found("template"))
    }

    fn version(&self, id: Uuid) -> Result<TemplateVersion> {
        self.versions.iter().find(|version| version.id == id).cloned().ok_or_else(|| not_found("template version"))
    }
}

fn api(status: u16, message: impl Into<String>) -> Error {
    Error::Api { status, message: message.into(), detail: String::new() }
}

fn not_found(what: &str) -> Error {
    api(404, format!("Resource not found or you do not have access to this {}.", what))
}

/// Records every mutation so tests can assert on the calls a store made.
#[derive(Default)]
pub struct FakeCoder {
    state: Mutex<State>,
}

impl FakeCoder {
    pub fn new() -> FakeCoder {
        FakeCoder::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_organization(&self, name: &str) -> Organization {
        let organization = Organization { id: Uuid::new_v4(), name: name.into(), display_name: String::new() };
        self.state().organizations.push(organization.clone());
        organization
    }

    /// Seeds a template whose active version serves `archive`.
    pub fn add_template(&self, organization: &Organization, name: &str, archive: Vec<u8>) -> Template {
        let mut state = self.state();
        let now = state.tick();

        let file_id = Uuid::new_v4();
        state.files.insert(file_id, archive);

        let template_id = Uuid::new_v4();
        let version = TemplateVersion {
            id: Uuid::new_v4(),
            template_id: Some(template_id),
            organization_id: Some(organization.id),
            name: "initial".into(),
            message: String::new(),
            job: ProvisionerJob { id: Uuid::new_v4(), status: "succeeded".into(), file_id },
            created_at: now,
            updated_at: now,
        };
        let template = Template {
            id: template_id,
            created_at: now,
            updated_at: now,
            organization_id: organization.id,
            organization_name: organization.name.clone(),
            name: name.into(),
            display_name: String::new(),
            description: String::new(),
            icon: String::new(),
            active_version_id: version.id,
            deprecated: false,
        };

        state.versions.push(version);
        state.templates.push(template.clone());
        template
    }

    /// Seeds an additional version of `template` without activating it.
    pub fn add_version(&self, template: &Template, archive: Vec<u8>) -> TemplateVersion {
        let mut state = self.state();
        let now = state.tick();
        let file_id = Uuid::new_v4();
        state.files.insert(file_id, archive);

        let version = TemplateVersion {
            id: Uuid::new_v4(),
            template_id: Some(template.id),
            organization_id: Some(template.organization_id),
            name: format!("v{}", state.versions.len()),
            message: String::new(),
            job: ProvisionerJob { id: Uuid::new_v4(), status: "succeeded".into(), file_id },
            created_at: now,
            updated_at: now,
        };
        state.versions.push(version.clone());
        version
    }

    pub fn workspace(&self, id: Uuid) -> Option<Workspace> {
        self.state().workspaces.iter().find(|workspace| workspace.id == id).cloned()
    }

    pub fn template_by_id(&self, id: Uuid) -> Option<Template> {
        self.state().templates.iter().find(|template| template.id == id).cloned()
    }

    pub fn uploads(&self) -> usize {
        self.state().uploads
    }

    pub fn versions_created(&self) -> usize {
        self.state().versions_created
    }

    pub fn transitions(&self) -> Vec<(Uuid, WorkspaceTransition)> {
        self.state().transitions.clone()
    }

    pub fn fail_transitions(&self, fail: bool) {
        self.state().fail_transitions = fail;
    }

    pub fn file(&self, id: Uuid) -> Option<Vec<u8>> {
        self.state().files.get(&id).cloned()
    }
}

#[async_trait]
impl CoderApi for FakeCoder {
    async fn organization(&self, organization: &str) -> Result<Organization> {
        self.state().organization(organization)
    }

    async fn template_by_name(&self, organization: &str, name: &str) -> Result<Template> {
        let state = self.state();
        let organization = state.organization(organization)?;
        state
            .templates
            .iter()
            .find(|template| template.organization_id == organization.id && template.name == name)
            .cloned()
            .ok_or_else(|| not_found("template"))
    }

    async fn template(&self, id: Uuid) -> Result<Template> {
        self.state().template_mut(id).map(|template| template.clone())
    }

    async fn templates(&self) -> Result<Vec<Template>> {
        Ok(self.state().templates.clone())
    }

    async fn create_template(&self, organization: Uuid, req: &CreateTemplateRequest) -> Result<Template> {
        let mut state = self.state();
        let organization = state.organization_by_id(organization)?;
        if state.templates.iter().any(|t| t.organization_id == organization.id && t.name == req.name) {
            return Err(api(409, format!("Template with name {:?} already exists.", req.name)));
        }
        let version = state.version(req.template_version_id).map_err(|_| api(400, "Template version not found."))?;
        if version.template_id.is_some() {
            return Err(api(400, "Template version is already assigned to a template."));
        }

        let now = state.tick();
        let template = Template {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            organization_id: organization.id,
            organization_name: organization.name,
            name: req.name.clone(),
            display_name: req.display_name.clone(),
            description: req.description.clone(),
            icon: req.icon.clone(),
            active_version_id: version.id,
            deprecated: false,
        };
        if let Some(version) = state.versions.iter_mut().find(|v| v.id == version.id) {
            version.template_id = Some(template.id);
        }
        state.templates.push(template.clone());
        Ok(template)
    }

    async fn update_template_meta(&self, id: Uuid, req: &UpdateTemplateMeta) -> Result<Template> {
        let mut state = self.state();
        let now = state.tick();
        let template = state.template_mut(id)?;
        if let Some(display_name) = &req.display_name {
            template.display_name = display_name.clone();
        }
        if let Some(description) = &req.description {
            template.description = description.clone();
        }
        if let Some(icon) = &req.icon {
            template.icon = icon.clone();
        }
        template.updated_at = now;
        Ok(template.clone())
    }

    async fn update_active_template_version(&self, id: Uuid, req: &UpdateActiveTemplateVersion) -> Result<()> {
        let mut state = self.state();
        let version = state.version(req.id)?;
        if version.template_id != Some(id) {
            return Err(api(400, "Template version does not belong to the template."));
        }
        let now = state.tick();
        let template = state.template_mut(id)?;
        template.active_version_id = version.id;
        template.updated_at = now;
        Ok(())
    }

    async fn delete_template(&self, id: Uuid) -> Result<()> {
        let mut state = self.state();
        if state.workspaces.iter().any(|workspace| workspace.template_id == id) {
            return Err(api(412, "All workspaces must be deleted before a template can be removed."));
        }
        let before = state.templates.len();
        state.templates.retain(|template| template.id != id);
        if state.templates.len() == before {
            return Err(not_found("template"));
        }
        Ok(())
    }

    async fn template_version(&self, id: Uuid) -> Result<TemplateVersion> {
        self.state().version(id)
    }

    async fn create_template_version(
        &self,
        organization: Uuid,
        req: &CreateTemplateVersionRequest,
    ) -> Result<TemplateVersion> {
        let mut state = self.state();
        let organization = state.organization_by_id(organization)?;
        if !state.files.contains_key(&req.file_id) {
            return Err(api(400, "File not found."));
        }

        let now = state.tick();
        let version = TemplateVersion {
            id: Uuid::new_v4(),
            template_id: req.template_id,
            organization_id: Some(organization.id),
            name: format!("v{}", state.versions.len()),
            message: req.message.clone(),
            job: ProvisionerJob { id: Uuid::new_v4(), status: "pending".into(), file_id: req.file_id },
            created_at: now,
            updated_at: now,
        };
        state.versions.push(version.clone());
        state.versions_created += 1;
        Ok(version)
    }

    async fn upload(&self, archive: Vec<u8>) -> Result<Uuid> {
        let mut state = self.state();
        let id = Uuid::new_v4();
        state.files.insert(id, archive);
        state.uploads += 1;
        Ok(id)
    }

    async fn download(&self, id: Uuid, _format: &str) -> Result<Vec<u8>> {
        self.state().files.get(&id).cloned().ok_or_else(|| not_found("file"))
    }

    async fn workspace_by_owner_and_name(&self, owner: &str, name: &str) -> Result<Workspace> {
        self.state()
            .workspaces
            .iter()
            .find(|workspace| workspace.owner_name == owner && workspace.name == name)
            .cloned()
            .ok_or_else(|| not_found("workspace"))
    }

    async fn workspaces(&self) -> Result<Vec<Workspace>> {
        Ok(self.state().workspaces.clone())
    }

    async fn create_workspace(&self, organization: Uuid, owner: &str, req: &CreateWorkspaceRequest) -> Result<Workspace> {
        let mut state = self.state();
        let organization = state.organization_by_id(organization)?;
        if state.workspaces.iter().any(|w| w.owner_name == owner && w.name == req.name) {
            return Err(api(409, format!("Workspace {:?} already exists.", req.name)));
        }

        let template = match (req.template_version_id, req.template_id) {
            (Some(version), _) => {
                let version = state.version(version)?;
                let template = version.template_id.ok_or_else(|| api(400, "Template version has no template."))?;
                state.template_mut(template)?.clone()
            }
            (None, Some(template)) => state.template_mut(template)?.clone(),
            (None, None) => return Err(api(400, "A template or template version is required.")),
        };

        let now = state.tick();
        let workspace = Workspace {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            owner_id: Uuid::new_v4(),
            owner_name: owner.into(),
            organization_id: organization.id,
            organization_name: organization.name,
            template_id: template.id,
            template_name: template.name,
            latest_build: WorkspaceBuild {
                id: Uuid::new_v4(),
                template_version_id: req.template_version_id.unwrap_or(template.active_version_id),
                build_number: 1,
                transition: WorkspaceTransition::Start,
                status: WorkspaceStatus::Pending,
                deadline: None,
                created_at: now,
                updated_at: now,
            },
            name: req.name.clone(),
            autostart_schedule: req.autostart_schedule.clone(),
            ttl_ms: req.ttl_ms,
            last_used_at: None,
        };
        state.workspaces.push(workspace.clone());
        Ok(workspace)
    }

    async fn create_workspace_build(&self, workspace: Uuid, req: &CreateWorkspaceBuildRequest) -> Result<WorkspaceBuild> {
        let mut state = self.state();
        if state.fail_transitions {
            return Err(api(500, "Internal error creating workspace build."));
        }
        let now = state.tick();
        let target = state.workspaces.iter_mut().find(|w| w.id == workspace).ok_or_else(|| not_found("workspace"))?;

        let build = WorkspaceBuild {
            id: Uuid::new_v4(),
            template_version_id: req.template_version_id.unwrap_or(target.latest_build.template_version_id),
            build_number: target.latest_build.build_number + 1,
            transition: req.transition,
            status: match req.transition {
                WorkspaceTransition::Start => WorkspaceStatus::Starting,
                WorkspaceTransition::Stop => WorkspaceStatus::Stopping,
                WorkspaceTransition::Delete => WorkspaceStatus::Deleting,
            },
            deadline: None,
            created_at: now,
            updated_at: now,
        };
        target.latest_build = build.clone();
        target.updated_at = now;
        state.transitions.push((workspace, req.transition));
        Ok(build)
    }
}
