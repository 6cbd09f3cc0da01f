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

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A Coder workspace, named `<organization>.<user>.<workspace>`.
#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "aggregation.coder.com",
    version = "v1alpha1",
    kind = "CoderWorkspace",
    plural = "coderworkspaces",
    namespaced,
    status = "CoderWorkspaceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CoderWorkspaceSpec {
    /// The organization that owns the workspace
    pub organization: String,
    /// The name of the template the workspace is built from
    pub template_name: String,
    /// Pins the workspace to a specific template version
    #[serde(default, rename = "templateVersionID", skip_serializing_if = "Option::is_none")]
    pub template_version_id: Option<String>,
    /// Whether the latest build starts the workspace, the only field that
    /// may change after creation
    #[serde(default)]
    pub running: bool,
    /// Time to live in milliseconds before an automatic stop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_millis: Option<i64>,
    /// Cron schedule for automatic starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autostart_schedule: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoderWorkspaceStatus {
    /// The backend identifier of the workspace
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub template_name: String,
    #[serde(default, rename = "latestBuildID")]
    pub latest_build_id: String,
    #[serde(default)]
    pub latest_build_status: String,
    #[serde(default)]
    pub latest_build_transition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<Time>,
    /// Deadline of the latest build after which the workspace stops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_shutdown: Option<Time>,
}

#[cfg(test)]
mod tests {
    use kube::Resource;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_workspace_wire_shape() {
        let mut workspace = CoderWorkspace::new(
            "acme.alice.dev",
            CoderWorkspaceSpec {
                organization: "acme".into(),
                template_name: "docker".into(),
                template_version_id: Some("0f5d".into()),
                running: true,
                ..Default::default()
            },
        );
        workspace.metadata.namespace = Some("coder".into());

        let value = serde_json::to_value(&workspace).unwrap();
        assert_eq!(value["apiVersion"], json!("aggregation.coder.com/v1alpha1"));
        assert_eq!(value["kind"], json!("CoderWorkspace"));
        assert_eq!(value["spec"]["templateVersionID"], json!("0f5d"));
        assert_eq!(value["spec"]["running"], json!(true));
        assert!(value["spec"].get("ttlMillis").is_none());
        assert_eq!(CoderWorkspace::plural(&()), "coderworkspaces");
    }

    #[test]
    fn test_workspace_running_defaults_to_false() {
        let spec: CoderWorkspaceSpec =
            serde_json::from_value(json!({"organization": "acme", "templateName": "docker"})).unwrap();
        assert!(!spec.running);
        assert_eq!(spec.template_version_id, None);
    }
}
