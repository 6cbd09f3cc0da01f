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

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The phase reported by a control plane whose backend is serving requests.
pub const PHASE_READY: &str = "Ready";

/// The secret key holding the operator token when the reference names none.
pub const DEFAULT_TOKEN_SECRET_KEY: &str = "token";

/// A Coder deployment managed in the cluster. The aggregated API server only
/// reads these to discover which backend instance serves a namespace.
#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "coder.com",
    version = "v1alpha1",
    kind = "CoderControlPlane",
    plural = "codercontrolplanes",
    namespaced,
    status = "CoderControlPlaneStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CoderControlPlaneSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_access: Option<OperatorAccess>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorAccess {
    /// Disables the operator token, which takes the instance out of discovery
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoderControlPlaneStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// The URL the backend is reachable at from inside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_token_secret_ref: Option<SecretKeyRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SecretKeyRef {
    pub fn key_or_default(&self) -> &str {
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => DEFAULT_TOKEN_SECRET_KEY,
        }
    }
}

impl CoderControlPlane {
    pub fn access_disabled(&self) -> bool {
        self.spec.operator_access.as_ref().map(|access| access.disabled).unwrap_or(false)
    }

    pub fn ready(&self) -> bool {
        self.status.as_ref().and_then(|status| status.phase.as_deref()) == Some(PHASE_READY)
    }

    pub fn url(&self) -> Option<&str> {
        self.status.as_ref().and_then(|status| status.url.as_deref()).filter(|url| !url.is_empty())
    }

    pub fn token_secret_ref(&self) -> Option<&SecretKeyRef> {
        self.status
            .as_ref()
            .and_then(|status| status.operator_token_secret_ref.as_ref())
            .filter(|reference| !reference.name.is_empty())
    }
}
