/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a node inside a ComfyUI API-format workflow (e.g. `"9"`).
pub type NodeId = String;

/// Engine-assigned identifier of a queued execution. Distinct from the
/// caller-chosen job id.
pub type PromptId = String;
