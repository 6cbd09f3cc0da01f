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

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Template {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub organization_id: Uuid,
    #[serde(default)]
    pub organization_name: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    pub active_version_id: Uuid,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TemplateVersion {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    pub job: ProvisionerJob,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ProvisionerJob {
    pub id: Uuid,
    #[serde(default)]
    pub status: String,
    pub file_id: Uuid,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: Uuid,
    pub owner_name: String,
    pub organization_id: Uuid,
    #[serde(default)]
    pub organization_name: String,
    pub template_id: Uuid,
    #[serde(default)]
    pub template_name: String,
    pub latest_build: WorkspaceBuild,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autostart_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Workspace {
    /// A workspace runs while its latest build starts it and has not failed or
    /// been canceled.
    pub fn running(&self) -> bool {
        self.latest_build.transition == WorkspaceTransition::Start
            && matches!(
                self.latest_build.status,
                WorkspaceStatus::Pending | WorkspaceStatus::Starting | WorkspaceStatus::Running
            )
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct WorkspaceBuild {
    pub id: Uuid,
    pub template_version_id: Uuid,
    #[serde(default)]
    pub build_number: i32,
    pub transition: WorkspaceTransition,
    pub status: WorkspaceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceTransition {
    Start,
    Stop,
    Delete,
}

impl Display for WorkspaceTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceTransition::Start => f.write_str("start"),
            WorkspaceTransition::Stop => f.write_str("stop"),
            WorkspaceTransition::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Canceling,
    Canceled,
    Deleting,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Starting => "starting",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Stopping => "stopping",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Failed => "failed",
            WorkspaceStatus::Canceling => "canceling",
            WorkspaceStatus::Canceled => "canceled",
            WorkspaceStatus::Deleting => "deleting",
            WorkspaceStatus::Deleted => "deleted",
            WorkspaceStatus::Unknown => "unknown",
        };
        f.write_str(status)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct WorkspacesResponse {
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub count: i64,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon: String,
    pub template_version_id: Uuid,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CreateTemplateVersionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub storage_method: String,
    pub file_id: Uuid,
    pub provisioner: String,
}

impl CreateTemplateVersionRequest {
    /// A terraform version built from an uploaded file.
    pub fn from_file(file_id: Uuid, template_id: Option<Uuid>, message: impl Into<String>) -> Self {
        CreateTemplateVersionRequest {
            template_id,
            message: message.into(),
            storage_method: "file".into(),
            file_id,
            provisioner: "terraform".into(),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UpdateActiveTemplateVersion {
    pub id: Uuid,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct UpdateTemplateMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_version_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autostart_schedule: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CreateWorkspaceBuildRequest {
    pub transition: WorkspaceTransition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_version_id: Option<Uuid>,
}

impl From<WorkspaceTransition> for CreateWorkspaceBuildRequest {
    fn from(transition: WorkspaceTransition) -> Self {
        CreateWorkspaceBuildRequest { transition, template_version_id: None }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct UploadResponse {
    pub hash: Uuid,
}

/// The error envelope returned by the backend on failure.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ErrorResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn workspace(transition: &str, status: &str) -> Workspace {
        serde_json::from_value(json!({
            "id": "5e1c8d6a-0c53-4a4f-9a8e-2b6f8a4c1d01",
            "created_at": "2024-01-02T03:04:05Z",
            "updated_at": "2024-01-02T03:04:05.123456789Z",
            "owner_id": "5e1c8d6a-0c53-4a4f-9a8e-2b6f8a4c1d02",
            "owner_name": "alice",
            "organization_id": "5e1c8d6a-0c53-4a4f-9a8e-2b6f8a4c1d03",
            "organization_name": "acme",
            "template_id": "5e1c8d6a-0c53-4a4f-9a8e-2b6f8a4c1d04",
            "template_name": "docker",
            "name": "dev",
            "latest_build": {
                "id": "5e1c8d6a-0c53-4a4f-9a8e-2b6f8a4c1d05",
                "template_version_id": "5e1c8d6a-0c53-4a4f-9a8e-2b6f8a4c1d06",
                "build_number": 3,
                "transition": transition,
                "status": status,
                "created_at": "2024-01-02T03:04:05Z",
                "updated_at": "2024-01-02T03:04:05Z"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_running_follows_latest_build() {
        assert!(workspace("start", "pending").running());
        assert!(workspace("start", "starting").running());
        assert!(workspace("start", "running").running());
        assert!(!workspace("start", "failed").running());
        assert!(!workspace("stop", "running").running());
        assert!(!workspace("stop", "stopped").running());
        assert!(!workspace("delete", "deleting").running());
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let workspace = workspace("start", "hibernating");
        assert_eq!(workspace.latest_build.status, WorkspaceStatus::Unknown);
        assert!(!workspace.running());
    }

    #[test]
    fn test_build_request_wire_shape() {
        let request = CreateWorkspaceBuildRequest::from(WorkspaceTransition::Stop);
        assert_eq!(serde_json::to_value(request).unwrap(), json!({"transition": "stop"}));
    }
}
