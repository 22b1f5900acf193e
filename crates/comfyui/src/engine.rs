//! The remote engine seam.
//!
//! [`EngineClient`] is everything the job tracker needs from a ComfyUI
//! server. [`ComfyUIEngine`] is the production implementation backed by
//! [`ComfyUIApi`] (HTTP) and [`ComfyUIClient`] (WebSocket); tests swap in
//! an in-memory engine.

use async_trait::async_trait;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIClientError, EventStream};
use crate::schema::{History, QueueInfo, SystemStats, WorkflowTicket};

/// Typed RPC surface of a remote ComfyUI engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Queue a workflow. Validation failures come back as a ticket with
    /// errors, not as `Err`.
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<WorkflowTicket, ComfyUIApiError>;

    async fn get_queue(&self) -> Result<QueueInfo, ComfyUIApiError>;

    async fn get_history(&self, prompt_id: &str) -> Result<History, ComfyUIApiError>;

    async fn get_system_stats(&self) -> Result<SystemStats, ComfyUIApiError>;

    /// Interrupt whatever is executing right now.
    async fn interrupt(&self) -> Result<(), ComfyUIApiError>;

    async fn delete_from_queue(
        &self,
        prompt_ids: &[String],
        clear: bool,
    ) -> Result<(), ComfyUIApiError>;

    /// Subscribe to the push channel as `client_id`.
    async fn open_event_stream(&self, client_id: &str) -> Result<EventStream, ComfyUIClientError>;
}

/// A ComfyUI server reached over HTTP and WebSocket.
pub struct ComfyUIEngine {
    api: ComfyUIApi,
    ws: ComfyUIClient,
}

impl ComfyUIEngine {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`. May embed
    ///   basic-auth credentials.
    pub fn new(api_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] for the HTTP side.
    pub fn with_client(client: reqwest::Client, api_url: &str) -> Self {
        Self {
            api: ComfyUIApi::with_client(client, api_url.to_string()),
            ws: ComfyUIClient::from_api_url(api_url),
        }
    }
}

#[async_trait]
impl EngineClient for ComfyUIEngine {
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<WorkflowTicket, ComfyUIApiError> {
        self.api.submit_workflow(workflow, client_id).await
    }

    async fn get_queue(&self) -> Result<QueueInfo, ComfyUIApiError> {
        self.api.get_queue().await
    }

    async fn get_history(&self, prompt_id: &str) -> Result<History, ComfyUIApiError> {
        self.api.get_history(prompt_id).await
    }

    async fn get_system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        self.api.get_system_stats().await
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        self.api.interrupt().await
    }

    async fn delete_from_queue(
        &self,
        prompt_ids: &[String],
        clear: bool,
    ) -> Result<(), ComfyUIApiError> {
        self.api.delete_from_queue(prompt_ids, clear).await
    }

    async fn open_event_stream(&self, client_id: &str) -> Result<EventStream, ComfyUIClientError> {
        let conn = self.ws.connect(client_id).await?;
        Ok(conn.into_event_stream())
    }
}
