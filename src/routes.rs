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

use axum::routing::get;
use axum::Router;
use coder_crds::{GROUP, VERSION};
use coder_storage::{TemplateStore, WorkspaceStore};

use crate::context::{Context, Served};
use crate::handlers;

pub fn build() -> Router<Arc<Context>> {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        //
        // discovery
        .route("/apis", get(handlers::discovery::groups))
        .route(&format!("/apis/{}", GROUP), get(handlers::discovery::group_detail))
        .route(&format!("/apis/{}/{}", GROUP, VERSION), get(handlers::discovery::resources))
        //
        // resources
        .merge(resource::<WorkspaceStore>())
        .merge(resource::<TemplateStore>())
}

fn resource<S: Served>() -> Router<Arc<Context>> {
    use handlers::resource::{create, delete, get as detail, list, list_all, update};

    let base = format!("/apis/{}/{}", GROUP, VERSION);
    let collection = format!("{}/namespaces/:namespace/{}", base, S::RESOURCE);

    Router::new()
        .route(&format!("{}/{}", base, S::RESOURCE), get(list_all::<S>))
        .route(&collection, get(list::<S>).post(create::<S>))
        .route(&format!("{}/:name", collection), get(detail::<S>).put(update::<S>).delete(delete::<S>))
}
