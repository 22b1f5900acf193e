//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI instance.  Call [`ComfyUIClient::connect`] to establish a
//! live [`ComfyUIConnection`] over WebSocket.

use base64::Engine as _;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

use crate::api::{split_credentials, Credentials};

/// Text frames received from ComfyUI. The stream ends when the server
/// closes the connection.
pub type EventStream = BoxStream<'static, Result<String, ComfyUIClientError>>;

/// Configuration handle for a ComfyUI instance.
///
/// Stores the WebSocket URL and credentials needed to subscribe to one
/// ComfyUI server. Create a [`ComfyUIConnection`] by calling
/// [`connect`](Self::connect).
pub struct ComfyUIClient {
    ws_url: String,
    credentials: Option<Credentials>,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ComfyUIClient {
    /// Create a client from the instance's HTTP API URL.
    ///
    /// `http` maps to `ws`, `https` to `wss`, and `/ws` is appended.
    /// Credentials embedded in the URL are sent as a basic
    /// `Authorization` header during the handshake.
    pub fn from_api_url(api_url: &str) -> Self {
        let (base, credentials) = split_credentials(api_url);
        Self {
            ws_url: ws_url_for(&base),
            credentials,
        }
    }

    /// WebSocket endpoint (e.g. `ws://host:8188/ws`), without the query.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// `client_id` is appended as a query parameter so that ComfyUI can
    /// address messages back to this specific client. Submissions made
    /// with the same `client_id` receive their node-level events here.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}?clientId={client_id}", self.ws_url);

        let mut request = url.as_str().into_client_request().map_err(|e| {
            ComfyUIClientError::Connection(format!("Invalid WebSocket URL {}: {e}", self.ws_url))
        })?;

        if let Some(creds) = &self.credentials {
            request
                .headers_mut()
                .insert(AUTHORIZATION, basic_auth_header(creds)?);
        }

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Turn the connection into a stream of text frames.
    ///
    /// Binary frames (preview images) and ping/pong are dropped; a close
    /// frame ends the stream; receive errors are yielded as
    /// [`ComfyUIClientError::Protocol`].
    pub fn into_event_stream(self) -> EventStream {
        let client_id = self.client_id;
        self.ws_stream
            .take_while(move |msg| {
                if let Ok(Message::Close(frame)) = msg {
                    tracing::info!(client_id = %client_id, ?frame, "ComfyUI WebSocket closed");
                    return futures::future::ready(false);
                }
                futures::future::ready(true)
            })
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(_) => None,
                    Err(e) => Some(Err(ComfyUIClientError::Protocol(e.to_string()))),
                }
            })
            .boxed()
    }
}

/// Derive the WebSocket endpoint from a credential-free HTTP base URL.
pub fn ws_url_for(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws")
}

fn basic_auth_header(creds: &Credentials) -> Result<HeaderValue, ComfyUIClientError> {
    let raw = format!(
        "{}:{}",
        creds.username,
        creds.password.as_deref().unwrap_or_default()
    );
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|e| ComfyUIClientError::Connection(format!("Invalid credentials: {e}")))
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_maps_to_ws() {
        assert_eq!(ws_url_for("http://localhost:8188"), "ws://localhost:8188/ws");
        assert_eq!(ws_url_for("http://localhost:8188/"), "ws://localhost:8188/ws");
    }

    #[test]
    fn https_maps_to_wss() {
        assert_eq!(
            ws_url_for("https://comfy.example.com/base"),
            "wss://comfy.example.com/base/ws"
        );
    }

    #[test]
    fn client_strips_credentials_from_ws_url() {
        let client = ComfyUIClient::from_api_url("http://user:pw@127.0.0.1:8188");
        assert_eq!(client.ws_url(), "ws://127.0.0.1:8188/ws");
    }

    #[test]
    fn basic_auth_header_encodes_credentials() {
        let header = basic_auth_header(&Credentials {
            username: "user".to_string(),
            password: Some("pass".to_string()),
        })
        .unwrap();
        assert_eq!(header.to_str().unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let client = ComfyUIClient::from_api_url("http://127.0.0.1:9");
        let result = client.connect("test-client").await;
        assert!(matches!(result, Err(ComfyUIClientError::Connection(_))));
    }
}
