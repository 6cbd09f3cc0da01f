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

//! Conversions from backend models to the served resource shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use coder_client::types::{Template, Workspace};
use coder_crds::{CoderTemplate, CoderTemplateSpec, CoderTemplateStatus};
use coder_crds::{CoderWorkspace, CoderWorkspaceSpec, CoderWorkspaceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;

use crate::error::{Error, Result};
use crate::naming::{TemplateName, WorkspaceName};

/// Derives a resource version from the backend's last update timestamp as
/// nanoseconds since the Unix epoch.
pub fn resource_version(updated_at: &DateTime<Utc>) -> String {
    let nanos = i128::from(updated_at.timestamp()) * 1_000_000_000 + i128::from(updated_at.timestamp_subsec_nanos());
    nanos.to_string()
}

fn metadata(name: String, namespace: &str, uid: String, created_at: &DateTime<Utc>, updated_at: &DateTime<Utc>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
        uid: Some(uid),
        creation_timestamp: Some(Time(*created_at)),
        resource_version: Some(resource_version(updated_at)),
        ..ObjectMeta::default()
    }
}

pub fn workspace(workspace: &Workspace, namespace: &str) -> Result<CoderWorkspace> {
    let name = WorkspaceName::from_parts(&workspace.organization_name, &workspace.owner_name, &workspace.name)
        .ok_or_else(|| {
            Error::internal(format!(
                "backend workspace {} has no valid composite name ({:?}, {:?}, {:?})",
                workspace.id, workspace.organization_name, workspace.owner_name, workspace.name
            ))
        })?;
    let build = &workspace.latest_build;

    Ok(CoderWorkspace {
        metadata: metadata(
            name.to_string(),
            namespace,
            workspace.id.to_string(),
            &workspace.created_at,
            &workspace.updated_at,
        ),
        spec: CoderWorkspaceSpec {
            organization: workspace.organization_name.clone(),
            template_name: workspace.template_name.clone(),
            template_version_id: Some(build.template_version_id.to_string()),
            running: workspace.running(),
            ttl_millis: workspace.ttl_ms,
            autostart_schedule: workspace.autostart_schedule.clone(),
        },
        status: Some(CoderWorkspaceStatus {
            id: workspace.id.to_string(),
            owner_name: workspace.owner_name.clone(),
            organization_name: workspace.organization_name.clone(),
            template_name: workspace.template_name.clone(),
            latest_build_id: build.id.to_string(),
            latest_build_status: build.status.to_string(),
            latest_build_transition: build.transition.to_string(),
            last_used_at: workspace.last_used_at.map(Time),
            auto_shutdown: build.deadline.map(Time),
        }),
    })
}

pub fn template(template: &Template, namespace: &str, files: Option<BTreeMap<String, String>>) -> Result<CoderTemplate> {
    let name = TemplateName::from_parts(&template.organization_name, &template.name).ok_or_else(|| {
        Error::internal(format!(
            "backend template {} has no valid composite name ({:?}, {:?})",
            template.id, template.organization_name, template.name
        ))
    })?;

    Ok(CoderTemplate {
        metadata: metadata(
            name.to_string(),
            namespace,
            template.id.to_string(),
            &template.created_at,
            &template.updated_at,
        ),
        spec: CoderTemplateSpec {
            organization: template.organization_name.clone(),
            version_id: Some(template.active_version_id.to_string()),
            display_name: template.display_name.clone(),
            description: template.description.clone(),
            icon: template.icon.clone(),
            files,
        },
        status: Some(CoderTemplateStatus {
            id: template.id.to_string(),
            organization_name: template.organization_name.clone(),
            active_version_id: template.active_version_id.to_string(),
            deprecated: template.deprecated,
            updated_at: Some(Time(template.updated_at)),
            auto_shutdown: None,
        }),
    })
}

/// The largest resource version among `versions`, compared numerically.
pub fn latest_resource_version<'a>(versions: impl IntoIterator<Item = Option<&'a String>>) -> String {
    versions
        .into_iter()
        .flatten()
        .filter_map(|version| version.parse::<i128>().ok().map(|number| (number, version)))
        .max_by_key(|(number, _)| *number)
        .map(|(_, version)| version.clone())
        .unwrap_or_default()
}
