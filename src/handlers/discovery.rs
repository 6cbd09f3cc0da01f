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

//! Discovery documents of the served API group.

use axum::response::IntoResponse;
use axum::Json;
use coder_crds::{CoderTemplate, CoderWorkspace, GROUP, VERSION};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroup, APIGroupList, APIResource, APIResourceList, GroupVersionForDiscovery,
};
use kube::Resource;

const VERBS: [&str; 6] = ["create", "delete", "get", "list", "update", "watch"];

fn group() -> APIGroup {
    let version = GroupVersionForDiscovery { group_version: coder_crds::api_version(), version: VERSION.into() };
    APIGroup {
        name: GROUP.into(),
        preferred_version: Some(version.clone()),
        versions: vec![version],
        ..APIGroup::default()
    }
}

fn resource<K: Resource<DynamicType = ()>>() -> APIResource {
    APIResource {
        name: K::plural(&()).into_owned(),
        singular_name: K::kind(&()).to_lowercase(),
        kind: K::kind(&()).into_owned(),
        namespaced: true,
        verbs: VERBS.iter().map(|verb| verb.to_string()).collect(),
        ..APIResource::default()
    }
}

/// Lists the API groups served by this server.
pub async fn groups() -> impl IntoResponse {
    Json(APIGroupList { groups: vec![group()] })
}

/// Describes the aggregation group and its versions.
pub async fn group_detail() -> impl IntoResponse {
    Json(group())
}

/// Lists the resources of the served group version.
pub async fn resources() -> impl IntoResponse {
    Json(APIResourceList {
        group_version: coder_crds::api_version(),
        resources: vec![resource::<CoderWorkspace>(), resource::<CoderTemplate>()],
    })
}
