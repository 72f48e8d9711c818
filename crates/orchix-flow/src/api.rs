//! Seam between the workflow layer and the container backend.

use std::future::Future;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::FlowError;
use crate::stream::ByteChunk;
use crate::wire::{
    ActionReply, ConfigSchema, ConflictCheckResult, LicenseInfo, OperationRequest,
    SelectionCandidates, SelectionNeeded, UpdateActions,
};

pub type ByteStream = BoxStream<'static, ByteChunk>;

pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Every backend call the workflow layer makes. The HTTP implementation is
/// [`HttpBackend`]; tests substitute a recording fake.
pub trait Backend: Send + Sync + 'static {
    /// POSTs the operation and hands back the raw response body.
    fn open_operation(
        &self,
        request: &OperationRequest,
    ) -> impl Future<Output = Result<ByteStream, FlowError>> + Send;

    fn check_conflicts(
        &self,
        name: Option<&str>,
        port: Option<&str>,
    ) -> impl Future<Output = Result<ConflictCheckResult, FlowError>> + Send;

    fn set_password(
        &self,
        container_name: &str,
        password: &str,
    ) -> impl Future<Output = Result<ActionReply, FlowError>> + Send;

    fn config_schema(
        &self,
        app_name: &str,
    ) -> impl Future<Output = Result<ConfigSchema, FlowError>> + Send;

    fn update_actions(
        &self,
        container_name: &str,
    ) -> impl Future<Output = Result<UpdateActions, FlowError>> + Send;

    fn license(&self) -> impl Future<Output = Result<LicenseInfo, FlowError>> + Send;

    fn activate_license(
        &self,
        license_key: &str,
    ) -> impl Future<Output = Result<ActionReply, FlowError>> + Send;

    fn deactivate_license(&self) -> impl Future<Output = Result<ActionReply, FlowError>> + Send;

    fn selection_needed(&self) -> impl Future<Output = Result<SelectionNeeded, FlowError>> + Send;

    fn selection_candidates(
        &self,
    ) -> impl Future<Output = Result<SelectionCandidates, FlowError>> + Send;

    fn save_selection(
        &self,
        selected: &[String],
    ) -> impl Future<Output = Result<ActionReply, FlowError>> + Send;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    session_token: Option<String>,
    csrf_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, FlowError> {
        let client = Client::builder()
            .user_agent(concat!("orchix-flow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            session_token: non_empty(&config.session_token),
            csrf_token: non_empty(&config.csrf_token),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        orchix_util::join_url(&self.base_url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let builder = self.authorize(self.client.post(self.url(path)));
        match &self.csrf_token {
            Some(token) => builder.header(CSRF_HEADER, token),
            None => builder,
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.session_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, FlowError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| FlowError::Transport(format!("backend unreachable: {e}")))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(FlowError::Unauthorized);
        }
        Ok(resp)
    }

    /// Reads a JSON reply. Error statuses still carry `{success, message}`
    /// bodies, so the body is decoded regardless of status when it parses.
    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, FlowError> {
        let resp = self.send(builder).await?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FlowError::Transport(format!("failed to read response: {e}")))?;
        match serde_json::from_slice::<T>(&body) {
            Ok(value) => Ok(value),
            Err(err) if status.is_success() => Err(FlowError::Decode(err)),
            Err(_) => Err(FlowError::Transport(format!(
                "backend responded with status {status}"
            ))),
        }
    }
}

impl Backend for HttpBackend {
    async fn open_operation(&self, request: &OperationRequest) -> Result<ByteStream, FlowError> {
        let path = request.path();
        debug!("POST {path} for {} {}", request.kind(), request.target_id());
        let resp = self.send(self.post(&path).json(&request.body())).await?;
        if !resp.status().is_success() {
            debug!("operation endpoint answered {}", resp.status());
        }
        Ok(resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| FlowError::Transport(format!("stream read failed: {e}")))
            })
            .boxed())
    }

    async fn check_conflicts(
        &self,
        name: Option<&str>,
        port: Option<&str>,
    ) -> Result<ConflictCheckResult, FlowError> {
        let mut query = Vec::new();
        if let Some(name) = name {
            query.push(("name", name.to_string()));
        }
        if let Some(port) = port {
            query.push(("port", port.to_string()));
        }
        self.json(self.get("/api/apps/check-conflicts").query(&query))
            .await
    }

    async fn set_password(
        &self,
        container_name: &str,
        password: &str,
    ) -> Result<ActionReply, FlowError> {
        let body = serde_json::json!({
            "container_name": container_name,
            "password": password,
        });
        self.json(self.post("/api/apps/set-password").json(&body))
            .await
    }

    async fn config_schema(&self, app_name: &str) -> Result<ConfigSchema, FlowError> {
        self.json(self.get(&format!("/api/apps/{app_name}/config-schema")))
            .await
    }

    async fn update_actions(&self, container_name: &str) -> Result<UpdateActions, FlowError> {
        self.json(self.get(&format!("/api/apps/update-actions/{container_name}")))
            .await
    }

    async fn license(&self) -> Result<LicenseInfo, FlowError> {
        self.json(self.get("/api/license")).await
    }

    async fn activate_license(&self, license_key: &str) -> Result<ActionReply, FlowError> {
        let body = serde_json::json!({ "license_key": license_key });
        self.json(self.post("/api/license/activate").json(&body))
            .await
    }

    async fn deactivate_license(&self) -> Result<ActionReply, FlowError> {
        self.json(self.post("/api/license/deactivate").json(&serde_json::json!({})))
            .await
    }

    async fn selection_needed(&self) -> Result<SelectionNeeded, FlowError> {
        self.json(self.get("/api/containers/selection-needed"))
            .await
    }

    async fn selection_candidates(&self) -> Result<SelectionCandidates, FlowError> {
        self.json(self.get("/api/containers/all-for-selection"))
            .await
    }

    async fn save_selection(&self, selected: &[String]) -> Result<ActionReply, FlowError> {
        let body = serde_json::json!({ "selected": selected });
        self.json(self.post("/api/containers/select").json(&body))
            .await
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
