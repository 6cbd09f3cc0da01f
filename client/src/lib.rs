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

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub mod error;
pub mod types;

pub use error::{Error, Result};
use types::*;

/// The header carrying the session token on every request.
pub const SESSION_TOKEN_HEADER: &str = "Coder-Session-Token";

/// The request timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Archive format requested when downloading template sources.
pub const ARCHIVE_FORMAT_ZIP: &str = "zip";

/// Largest file body `download` accepts.
pub const MAX_DOWNLOAD_SIZE: usize = 20 * 1024 * 1024;

const CONTENT_TYPE_ZIP: &str = "application/zip";

/// The subset of the Coder API the aggregated API server relies on.
///
/// `organization` arguments accept either the organization name or its id.
#[async_trait]
pub trait CoderApi: Send + Sync {
    async fn organization(&self, organization: &str) -> Result<Organization>;

    async fn template_by_name(&self, organization: &str, name: &str) -> Result<Template>;
    async fn template(&self, id: Uuid) -> Result<Template>;
    async fn templates(&self) -> Result<Vec<Template>>;
    async fn create_template(&self, organization: Uuid, req: &CreateTemplateRequest) -> Result<Template>;
    async fn update_template_meta(&self, id: Uuid, req: &UpdateTemplateMeta) -> Result<Template>;
    async fn update_active_template_version(&self, id: Uuid, req: &UpdateActiveTemplateVersion) -> Result<()>;
    async fn delete_template(&self, id: Uuid) -> Result<()>;

    async fn template_version(&self, id: Uuid) -> Result<TemplateVersion>;
    async fn create_template_version(
        &self,
        organization: Uuid,
        req: &CreateTemplateVersionRequest,
    ) -> Result<TemplateVersion>;

    /// Uploads a zip archive and returns the id of the stored file.
    async fn upload(&self, archive: Vec<u8>) -> Result<Uuid>;
    /// Downloads a stored file converted to the given archive format.
    async fn download(&self, id: Uuid, format: &str) -> Result<Vec<u8>>;

    async fn workspace_by_owner_and_name(&self, owner: &str, name: &str) -> Result<Workspace>;
    async fn workspaces(&self) -> Result<Vec<Workspace>>;
    async fn create_workspace(&self, organization: Uuid, owner: &str, req: &CreateWorkspaceRequest)
        -> Result<Workspace>;
    async fn create_workspace_build(&self, workspace: Uuid, req: &CreateWorkspaceBuildRequest)
        -> Result<WorkspaceBuild>;
}

/// HTTP implementation of [`CoderApi`] bound to one backend instance.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("base", &self.base.as_str()).finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(base: Url, token: impl Into<String>, timeout: Duration) -> Result<Client> {
        if base.cannot_be_a_base() {
            return Err(Error::InvalidBaseUrl(base.to_string()));
        }

        let http = reqwest::Client::builder().timeout(timeout).build().map_err(Error::Http)?;
        Ok(Client { http, base, token: token.into() })
    }

    /// Parses the base URL and builds a client with the default timeout.
    pub fn parse(base: &str, token: impl Into<String>) -> Result<Client> {
        let base = Url::parse(base).map_err(Error::UrlParseError)?;
        Client::new(base, token, DEFAULT_TIMEOUT)
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| Error::InvalidBaseUrl(self.base.to_string()))?;
            path.pop_if_empty().extend(["api", "v2"]).extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("{} {}", method, url);
        self.http.request(method, url).header(SESSION_TOKEN_HEADER, &self.token)
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(Error::Http)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.bytes().await.map_err(Error::Http)?;
        let envelope = serde_json::from_slice::<ErrorResponse>(&body).unwrap_or_else(|_| ErrorResponse {
            message: String::from_utf8_lossy(&body).trim().to_string(),
            detail: String::new(),
        });
        debug!("Backend responded {}: {}", status, envelope.message);

        Err(Error::Api { status: status.as_u16(), message: envelope.message, detail: envelope.detail })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.execute(builder).await?;
        let body = response.bytes().await.map_err(Error::Http)?;
        serde_json::from_slice(&body).map_err(Error::Decode)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.url(segments)?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn send<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<T> {
        let url = self.url(segments)?;
        self.json(self.request(method, url).json(body)).await
    }
}

#[async_trait]
impl CoderApi for Client {
    async fn organization(&self, organization: &str) -> Result<Organization> {
        self.get(&["organizations", organization]).await
    }

    async fn template_by_name(&self, organization: &str, name: &str) -> Result<Template> {
        self.get(&["organizations", organization, "templates", name]).await
    }

    async fn template(&self, id: Uuid) -> Result<Template> {
        self.get(&["templates", &id.to_string()]).await
    }

    async fn templates(&self) -> Result<Vec<Template>> {
        self.get(&["templates"]).await
    }

    async fn create_template(&self, organization: Uuid, req: &CreateTemplateRequest) -> Result<Template> {
        self.send(Method::POST, &["organizations", &organization.to_string(), "templates"], req).await
    }

    async fn update_template_meta(&self, id: Uuid, req: &UpdateTemplateMeta) -> Result<Template> {
        self.send(Method::PATCH, &["templates", &id.to_string()], req).await
    }

    async fn update_active_template_version(&self, id: Uuid, req: &UpdateActiveTemplateVersion) -> Result<()> {
        let url = self.url(&["templates", &id.to_string(), "versions"])?;
        self.execute(self.request(Method::PATCH, url).json(req)).await?;
        Ok(())
    }

    async fn delete_template(&self, id: Uuid) -> Result<()> {
        let url = self.url(&["templates", &id.to_string()])?;
        self.execute(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn template_version(&self, id: Uuid) -> Result<TemplateVersion> {
        self.get(&["templateversions", &id.to_string()]).await
    }

    async fn create_template_version(
        &self,
        organization: Uuid,
        req: &CreateTemplateVersionRequest,
    ) -> Result<TemplateVersion> {
        self.send(Method::POST, &["organizations", &organization.to_string(), "templateversions"], req).await
    }

    async fn upload(&self, archive: Vec<u8>) -> Result<Uuid> {
        let url = self.url(&["files"])?;
        let builder = self.request(Method::POST, url).header(CONTENT_TYPE, CONTENT_TYPE_ZIP).body(archive);
        let response: UploadResponse = self.json(builder).await?;
        Ok(response.hash)
    }

    async fn download(&self, id: Uuid, format: &str) -> Result<Vec<u8>> {
        let mut url = self.url(&["files", &id.to_string()])?;
        url.query_pairs_mut().append_pair("format", format);

        let mut response = self.execute(self.request(Method::GET, url)).await?;
        if response.content_length().is_some_and(|length| length > MAX_DOWNLOAD_SIZE as u64) {
            return Err(Error::TooLarge(MAX_DOWNLOAD_SIZE));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(Error::Http)? {
            if body.len() + chunk.len() > MAX_DOWNLOAD_SIZE {
                return Err(Error::TooLarge(MAX_DOWNLOAD_SIZE));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn workspace_by_owner_and_name(&self, owner: &str, name: &str) -> Result<Workspace> {
        self.get(&["users", owner, "workspace", name]).await
    }

    async fn workspaces(&self) -> Result<Vec<Workspace>> {
        let response: WorkspacesResponse = self.get(&["workspaces"]).await?;
        Ok(response.workspaces)
    }

    async fn create_workspace(
        &self,
        organization: Uuid,
        owner: &str,
        req: &CreateWorkspaceRequest,
    ) -> Result<Workspace> {
        let organization = organization.to_string();
        self.send(Method::POST, &["organizations", &organization, "members", owner, "workspaces"], req).await
    }

    async fn create_workspace_build(
        &self,
        workspace: Uuid,
        req: &CreateWorkspaceBuildRequest,
    ) -> Result<WorkspaceBuild> {
        self.send(Method::POST, &["workspaces", &workspace.to_string(), "builds"], req).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> Client {
        Client::parse(&server.uri(), "session-token").unwrap()
    }

    fn template_json(id: Uuid) -> serde_json::Value {
        json!({
            "id": id,
            "created_at": "2024-01-02T03:04:05Z",
            "updated_at": "2024-01-02T03:04:05Z",
            "organization_id": "0b8e4b4e-7a5e-4bb0-9d8e-1f5f0e6f3c01",
            "organization_name": "acme",
            "name": "docker",
            "display_name": "Docker",
            "active_version_id": "0b8e4b4e-7a5e-4bb0-9d8e-1f5f0e6f3c02"
        })
    }

    #[tokio::test]
    async fn test_session_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations/acme"))
            .and(header(SESSION_TOKEN_HEADER, "session-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "0b8e4b4e-7a5e-4bb0-9d8e-1f5f0e6f3c01",
                "name": "acme"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let organization = client(&server).organization("acme").await.unwrap();
        assert_eq!(organization.name, "acme");
    }

    #[tokio::test]
    async fn test_error_envelope_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations/acme/templates/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "message": "Template \"missing\" not found.",
                "detail": "sql: no rows"
            })))
            .mount(&server)
            .await;

        let err = client(&server).template_by_name("acme", "missing").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.message(), Some("Template \"missing\" not found."));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_plain_text_errors_keep_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/templates"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway\n"))
            .mount(&server)
            .await;

        let err = client(&server).templates().await.unwrap_err();
        assert_eq!(err.status(), Some(502));
        assert_eq!(err.message(), Some("bad gateway"));
    }

    #[tokio::test]
    async fn test_base_path_is_preserved() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/coder/api/v2/templates/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(template_json(id)))
            .mount(&server)
            .await;

        let client = Client::parse(&format!("{}/coder/", server.uri()), "t").unwrap();
        let template = client.template(id).await.unwrap();
        assert_eq!(template.id, id);
        assert_eq!(template.display_name, "Docker");
        assert!(!template.deprecated);
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let server = MockServer::start().await;
        let file_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/api/v2/files"))
            .and(header("content-type", "application/zip"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "hash": file_id })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v2/files/{}", file_id)))
            .and(query_param("format", "zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x50, 0x4b, 0x05, 0x06]))
            .mount(&server)
            .await;

        let client = client(&server);
        let uploaded = client.upload(vec![1, 2, 3]).await.unwrap();
        assert_eq!(uploaded, file_id);

        let bytes = client.download(file_id, ARCHIVE_FORMAT_ZIP).await.unwrap();
        assert_eq!(bytes, vec![0x50, 0x4b, 0x05, 0x06]);
    }

    #[tokio::test]
    async fn test_download_is_bounded() {
        let server = MockServer::start().await;
        let file_id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/api/v2/files/{}", file_id)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; MAX_DOWNLOAD_SIZE + 1]))
            .mount(&server)
            .await;

        let err = client(&server).download(file_id, ARCHIVE_FORMAT_ZIP).await.unwrap_err();
        assert!(matches!(err, Error::TooLarge(limit) if limit == MAX_DOWNLOAD_SIZE));
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn test_workspace_build_transition() {
        let server = MockServer::start().await;
        let workspace = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path(format!("/api/v2/workspaces/{}/builds", workspace)))
            .and(body_json(json!({ "transition": "delete" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": Uuid::new_v4(),
                "template_version_id": Uuid::new_v4(),
                "build_number": 4,
                "transition": "delete",
                "status": "pending",
                "created_at": "2024-01-02T03:04:05Z",
                "updated_at": "2024-01-02T03:04:05Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let build = client(&server)
            .create_workspace_build(workspace, &WorkspaceTransition::Delete.into())
            .await
            .unwrap();
        assert_eq!(build.transition, WorkspaceTransition::Delete);
        assert_eq!(build.status, WorkspaceStatus::Pending);
    }

    #[test]
    fn test_opaque_base_url_is_rejected() {
        let base = Url::parse("mailto:coder@example.com").unwrap();
        assert!(matches!(Client::new(base, "t", DEFAULT_TIMEOUT), Err(Error::InvalidBaseUrl(_))));
    }
}
