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

pub mod control_plane;
pub mod template;
pub mod workspace;

pub use control_plane::{CoderControlPlane, CoderControlPlaneSpec, CoderControlPlaneStatus};
pub use template::{CoderTemplate, CoderTemplateSpec, CoderTemplateStatus};
pub use workspace::{CoderWorkspace, CoderWorkspaceSpec, CoderWorkspaceStatus};

/// API group of the resources served by the aggregated API server.
pub const GROUP: &str = "aggregation.coder.com";

/// API version of the resources served by the aggregated API server.
pub const VERSION: &str = "v1alpha1";

/// Returns `group/version` for the served resources.
pub fn api_version() -> String {
    format!("{}/{}", GROUP, VERSION)
}
