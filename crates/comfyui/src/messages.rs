//! Decoding of ComfyUI event-stream frames.
//!
//! Every text frame is a `{"type": "<kind>", "data": {...}}` envelope.
//! Kinds the job tracker reacts to get a typed payload; everything else
//! (extensions publish their own kinds) lands in
//! [`ComfyUIMessage::Unknown`] untouched.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// One decoded event-stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ComfyUIMessage {
    /// Queue depth broadcast; also the first frame after connecting.
    Status(StatusData),

    ExecutionStart(ExecutionStartData),

    /// Nodes served from cache instead of executing.
    ExecutionCached(ExecutionCachedData),

    /// Node `node` of a prompt started; `node: None` ends the prompt.
    Executing(ExecutingData),

    /// Sampler step counter for the current node.
    Progress(ProgressData),

    /// A node produced UI output.
    Executed(ExecutedData),

    ExecutionError(ExecutionFailureData),

    /// Sent after `POST /interrupt` stops a prompt.
    ExecutionInterrupted(ExecutionFailureData),

    ExecutionSuccess(ExecutionSuccessData),

    /// A kind without a typed payload.
    Unknown {
        kind: String,
        data: serde_json::Value,
    },
}

impl ComfyUIMessage {
    /// The envelope's `type` string.
    pub fn kind(&self) -> &str {
        match self {
            Self::Status(_) => "status",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionCached(_) => "execution_cached",
            Self::Executing(_) => "executing",
            Self::Progress(_) => "progress",
            Self::Executed(_) => "executed",
            Self::ExecutionError(_) => "execution_error",
            Self::ExecutionInterrupted(_) => "execution_interrupted",
            Self::ExecutionSuccess(_) => "execution_success",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub status: Option<QueueStatus>,
    /// Session id, sent once per connection.
    #[serde(default)]
    pub sid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecInfo {
    #[serde(default)]
    pub queue_remaining: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionCachedData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload of `executing`.
///
/// A freshly connected client may get only `last_node_id`, naming the
/// node that was running when it subscribed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutingData {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub last_node_id: Option<String>,
}

/// Payload of `progress`. Custom nodes report all sorts of values here,
/// so they stay untyped until [`ProgressData::steps`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, alias = "max_value")]
    pub max: serde_json::Value,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// `(value, max)` if both are non-negative integers.
    pub fn steps(&self) -> Option<(u64, u64)> {
        Some((self.value.as_u64()?, self.max.as_u64()?))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    #[serde(default, alias = "output_ui")]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload shared by `execution_error` and `execution_interrupted`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionFailureData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub executed: Vec<String>,
    /// Undecoded frame data, traceback included.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: String,
}

/// Decode one text frame.
///
/// Fails on malformed JSON, a missing `type`, or a typed kind whose
/// payload has the wrong shape; unrecognised kinds always succeed.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    Ok(match kind.as_str() {
        "status" => ComfyUIMessage::Status(payload(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(payload(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(payload(data)?),
        "executing" => ComfyUIMessage::Executing(payload(data)?),
        "progress" => ComfyUIMessage::Progress(payload(data)?),
        "executed" => ComfyUIMessage::Executed(payload(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(failure(data)?),
        "execution_interrupted" => ComfyUIMessage::ExecutionInterrupted(failure(data)?),
        "execution_success" => ComfyUIMessage::ExecutionSuccess(payload(data)?),
        _ => ComfyUIMessage::Unknown { kind, data },
    })
}

fn payload<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

fn failure(data: serde_json::Value) -> Result<ExecutionFailureData, serde_json::Error> {
    let mut parsed: ExecutionFailureData = serde_json::from_value(data.clone())?;
    parsed.raw = data;
    Ok(parsed)
}
