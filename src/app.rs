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

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::context::Context;
use crate::routes;

pub async fn run(ctx: Arc<Context>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.port));
    let app = routes::build().layer(TraceLayer::new_for_http()).with_state(ctx.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind {}: {}", addr, err);
            return;
        }
    };
    info!("Listening on {}", addr);

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(ctx)).await {
        error!("Server error: {}", err);
    }
}

/// Resolves on Ctrl+C once every open watch has been closed, so graceful
/// shutdown is not held up by streaming responses.
async fn shutdown_signal(ctx: Arc<Context>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {}", err);
    }
    info!("Shutting down");
    ctx.shutdown().await;
}
