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
use std::time::Duration;

use coder_storage::provider::{ClientProvider, DiscoveryProvider, KubeInstanceSource, StaticProvider};
use coder_storage::{Storage, TemplateStore, WorkspaceStore};
use tracing::info;
use url::Url;

use crate::config::Config;

/// The core type through which handler functions can access common API state.
pub struct Context {
    pub config: Config,
    pub workspaces: WorkspaceStore,
    pub templates: TemplateStore,
}

impl Context {
    pub async fn new(config: Config) -> anyhow::Result<Context> {
        let provider = provider(&config).await?;
        Ok(Context::with_provider(config, provider))
    }

    pub fn with_provider(config: Config, provider: Arc<dyn ClientProvider>) -> Context {
        let capacity = config.watch_queue_capacity;
        Context {
            workspaces: WorkspaceStore::new(provider.clone(), capacity),
            templates: TemplateStore::new(provider, capacity),
            config,
        }
    }

    /// Drains pending watch events and ends every open watch.
    pub async fn shutdown(&self) {
        self.workspaces.shutdown().await;
        self.templates.shutdown().await;
    }
}

async fn provider(config: &Config) -> anyhow::Result<Arc<dyn ClientProvider>> {
    let timeout = Duration::from_secs(config.coder_request_timeout);

    match config.coder_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            if config.coder_session_token.is_empty() {
                anyhow::bail!("a session token is required when the Coder URL is configured");
            }
            let client = coder_client::Client::new(Url::parse(url)?, config.coder_session_token.clone(), timeout)?;
            info!("Serving the Coder deployment at {}", url);
            Ok(Arc::new(StaticProvider::new(Arc::new(client), config.coder_namespace.clone())))
        }
        None => {
            let k8s = kube::Client::try_default().await?;
            info!("Discovering Coder deployments from control plane resources");
            Ok(Arc::new(DiscoveryProvider::new(Arc::new(KubeInstanceSource::new(k8s)), timeout)))
        }
    }
}

/// Selects the store serving a resource from the shared context.
pub trait Served: Storage {
    fn select(ctx: &Context) -> &Self;
}

impl Served for WorkspaceStore {
    fn select(ctx: &Context) -> &Self {
        &ctx.workspaces
    }
}

impl Served for TemplateStore {
    fn select(ctx: &Context) -> &Self {
        &ctx.templates
    }
}
