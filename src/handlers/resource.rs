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

//! Generic REST handlers shared by every served resource.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coder_storage::{ListOptions, RequestContext, Storage, UpdateFn};
use futures::StreamExt;
use kube::Resource;
use serde_json::json;
use tracing::debug;

use crate::context::{Context, Served};
use crate::errors::ApiError;

type Options = Result<Query<ListOptions>, QueryRejection>;
type Payload<K> = Result<Json<K>, JsonRejection>;

fn options(query: Options) -> Result<ListOptions, ApiError> {
    query.map(|Query(options)| options).map_err(|err| ApiError::InvalidQuery(err.body_text()))
}

fn payload<K>(payload: Payload<K>) -> Result<K, ApiError> {
    payload.map(|Json(object)| object).map_err(|err| ApiError::InvalidBody(err.body_text()))
}

/// Lists or watches the objects of every namespace.
pub async fn list_all<S: Served>(State(ctx): State<Arc<Context>>, query: Options) -> Result<Response, ApiError> {
    collection::<S>(&ctx, RequestContext::new(""), options(query)?).await
}

/// Lists or watches the objects of one namespace.
pub async fn list<S: Served>(
    State(ctx): State<Arc<Context>>,
    Path(namespace): Path<String>,
    query: Options,
) -> Result<Response, ApiError> {
    collection::<S>(&ctx, RequestContext::new(namespace), options(query)?).await
}

async fn collection<S: Served>(ctx: &Context, rctx: RequestContext, options: ListOptions) -> Result<Response, ApiError> {
    let store = S::select(ctx);
    if options.is_watch() {
        return watch(store, rctx, options).await;
    }

    let list = store.list(&rctx, &options).await?;
    let kind = format!("{}List", S::Object::kind(&()));
    Ok(Json(json!({
        "apiVersion": S::Object::api_version(&()),
        "kind": kind,
        "metadata": { "resourceVersion": list.resource_version },
        "items": list.items,
    }))
    .into_response())
}

/// Streams watch events as newline-delimited JSON until the watch ends or
/// the client goes away.
async fn watch<S: Storage>(store: &S, rctx: RequestContext, options: ListOptions) -> Result<Response, ApiError> {
    let watcher = store.watch(&rctx, &options).await?;
    debug!("Started watch of {} in namespace {:?}", S::RESOURCE, rctx.namespace);

    let lines = watcher.map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            line
        })
    });

    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from_stream(lines))
        .map_err(|err| ApiError::Encoding(err.to_string()))
}

pub async fn get<S: Served>(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let object = S::select(&ctx).get(&RequestContext::new(namespace), &name).await?;
    Ok(Json(object).into_response())
}

pub async fn create<S: Served>(
    State(ctx): State<Arc<Context>>,
    Path(namespace): Path<String>,
    object: Payload<S::Object>,
) -> Result<Response, ApiError> {
    let object = S::select(&ctx).create(&RequestContext::new(namespace), payload(object)?).await?;
    Ok((StatusCode::CREATED, Json(object)).into_response())
}

/// Replaces an object with the request body.
pub async fn update<S: Served>(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
    object: Payload<S::Object>,
) -> Result<Response, ApiError> {
    let desired = payload(object)?;
    let replace: UpdateFn<S::Object> = Box::new(move |_current: S::Object| Ok(desired));
    let object = S::select(&ctx).update(&RequestContext::new(namespace), &name, replace).await?;
    Ok(Json(object).into_response())
}

/// Answers 200 once the object is gone and 202 while its deletion is pending.
pub async fn delete<S: Served>(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let outcome = S::select(&ctx).delete(&RequestContext::new(namespace), &name).await?;
    let status = if outcome.deleted { StatusCode::OK } else { StatusCode::ACCEPTED };
    Ok((status, Json(outcome.object)).into_response())
}
