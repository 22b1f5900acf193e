//! Typed wrappers over ComfyUI's HTTP endpoints.
//!
//! Covers what the job tracker needs: `POST /prompt`, `GET /queue`,
//! `GET /history/{id}`, `GET /system_stats`, `POST /interrupt` and
//! queue deletion. Basic-auth credentials embedded in the base URL are
//! stripped out and sent with every request.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::schema::{History, QueueInfo, SystemStats, WorkflowTicket};

/// REST client bound to one ComfyUI base URL.
pub struct ComfyUIApi {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
}

/// Basic-auth credentials lifted out of the configured URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure: connect, TLS, timeout, truncated body.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode ComfyUI response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ComfyUIApi {
    /// `api_url` is the server root, e.g. `http://host:8188`, optionally
    /// with `user:pass@` credentials.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Share a connection pool with other clients.
    pub fn with_client(http: reqwest::Client, api_url: String) -> Self {
        let (base_url, credentials) = split_credentials(&api_url);
        Self {
            http,
            base_url,
            credentials,
        }
    }

    /// Base URL without credentials or trailing slash.
    pub fn api_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// `POST /prompt`.
    ///
    /// A `400` whose body is a ticket with `error`/`node_errors` is a
    /// validation rejection and comes back as `Ok`; the caller decides
    /// what a rejected ticket means.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<WorkflowTicket, ComfyUIApiError> {
        let response = self
            .request(Method::POST, "/prompt")
            .json(&serde_json::json!({ "prompt": workflow, "client_id": client_id }))
            .send()
            .await?;

        if response.status() != StatusCode::BAD_REQUEST {
            return decode(response).await;
        }
        let body = response.text().await?;
        match serde_json::from_str::<WorkflowTicket>(&body) {
            Ok(ticket) if ticket.has_errors() => Ok(ticket),
            _ => Err(ComfyUIApiError::Status {
                status: StatusCode::BAD_REQUEST.as_u16(),
                body,
            }),
        }
    }

    /// `GET /queue`: running and pending prompts.
    pub async fn get_queue(&self) -> Result<QueueInfo, ComfyUIApiError> {
        decode(self.request(Method::GET, "/queue").send().await?).await
    }

    /// `GET /history/{prompt_id}`.
    ///
    /// Empty while the prompt is queued or running, and forever if the
    /// server restarted and forgot it.
    pub async fn get_history(&self, prompt_id: &str) -> Result<History, ComfyUIApiError> {
        let path = format!("/history/{prompt_id}");
        decode(self.request(Method::GET, &path).send().await?).await
    }

    /// `GET /system_stats`. The tracker uses it as a liveness probe.
    pub async fn get_system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        decode(self.request(Method::GET, "/system_stats").send().await?).await
    }

    /// `POST /interrupt`. Stops whatever prompt is executing; ComfyUI
    /// offers no way to target a specific one.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self.request(Method::POST, "/interrupt").send().await?;
        success(response).await.map(drop)
    }

    /// `POST /queue` with a `delete` list. `clear` also empties every
    /// other pending prompt.
    pub async fn delete_from_queue(
        &self,
        prompt_ids: &[String],
        clear: bool,
    ) -> Result<(), ComfyUIApiError> {
        let response = self
            .request(Method::POST, "/queue")
            .json(&delete_body(prompt_ids, clear))
            .send()
            .await?;
        success(response).await.map(drop)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.credentials {
            Some(creds) => request.basic_auth(&creds.username, creds.password.as_deref()),
            None => request,
        }
    }
}

/// Turn a non-2xx response into [`ComfyUIApiError::Status`].
async fn success(response: Response) -> Result<Response, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<body unavailable: {e}>"));
    Err(ComfyUIApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ComfyUIApiError> {
    let bytes = success(response).await?.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn delete_body(prompt_ids: &[String], clear: bool) -> serde_json::Value {
    let mut body = serde_json::json!({ "delete": prompt_ids });
    if clear {
        body["clear"] = serde_json::Value::Bool(true);
    }
    body
}

/// Split `user:pass@` out of a base URL and drop any trailing slash.
///
/// Unparseable URLs are returned unchanged so the first request reports
/// the problem.
pub fn split_credentials(url: &str) -> (String, Option<Credentials>) {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return (url.trim_end_matches('/').to_string(), None);
    };

    let credentials = if parsed.username().is_empty() && parsed.password().is_none() {
        None
    } else {
        Some(Credentials {
            username: parsed.username().to_string(),
            password: parsed.password().map(str::to_string),
        })
    };

    if credentials.is_some() && strip_userinfo(&mut parsed).is_err() {
        tracing::warn!(
            scheme = parsed.scheme(),
            "Cannot move credentials out of this URL, sending it unchanged",
        );
        return (url.trim_end_matches('/').to_string(), None);
    }

    (parsed.as_str().trim_end_matches('/').to_string(), credentials)
}

/// Remove `user:pass@`. Fails for URLs that cannot carry credentials
/// (no host, or `file:`).
fn strip_userinfo(url: &mut reqwest::Url) -> Result<(), ()> {
    url.set_username("")?;
    url.set_password(None)
}
