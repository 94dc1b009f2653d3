//! Task messages and argument payloads

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content type of JSON-encoded argument payloads
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Queue used when a message does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Errors decoding a task payload
///
/// Payload errors are never retryable: redelivering the same bytes
/// cannot make them decodable.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Content type is not one the worker can decode
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Body is not valid for its content type
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Arguments do not match the task's input type
    #[error("arguments do not match task input: {0}")]
    InvalidArguments(String),
}

/// Positional and keyword arguments of a task invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl TaskArgs {
    /// Create empty arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Decode the arguments into a typed input
    ///
    /// Keyword arguments are used when there are no positional ones, and
    /// positional arguments (as a sequence) when there are no keyword ones.
    /// Mixing both cannot be mapped onto a single input type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let value = match (self.args.is_empty(), self.kwargs.is_empty()) {
            (true, _) => serde_json::Value::Object(self.kwargs.clone()),
            (false, true) => serde_json::Value::Array(self.args.clone()),
            (false, false) => {
                return Err(PayloadError::InvalidArguments(
                    "cannot mix positional and keyword arguments for a typed task".into(),
                ))
            }
        };

        serde_json::from_value(value).map_err(|e| PayloadError::InvalidArguments(e.to_string()))
    }
}

/// Serialized task arguments plus their content-type tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// MIME type of `body`
    pub content_type: String,

    /// Opaque encoded arguments
    pub body: Vec<u8>,
}

impl TaskPayload {
    /// Create a payload from raw bytes
    pub fn new(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            body,
        }
    }

    /// Encode arguments as JSON
    pub fn json(args: &TaskArgs) -> Self {
        // Serializing a Vec<Value> and a Map<String, Value> cannot fail
        let body = serde_json::to_vec(args).unwrap_or_default();
        Self::new(CONTENT_TYPE_JSON, body)
    }

    /// Decode the arguments carried by this payload
    pub fn decode_args(&self) -> Result<TaskArgs, PayloadError> {
        if self.content_type != CONTENT_TYPE_JSON {
            return Err(PayloadError::UnsupportedContentType(
                self.content_type.clone(),
            ));
        }
        if self.body.is_empty() {
            return Ok(TaskArgs::default());
        }
        serde_json::from_slice(&self.body).map_err(PayloadError::Malformed)
    }
}

impl Default for TaskPayload {
    fn default() -> Self {
        Self::json(&TaskArgs::default())
    }
}

/// A task message as delivered by the broker
///
/// Immutable once received. Retrying a task does not mutate the message;
/// the broker redelivers it with a new retry count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Unique message id; also the key of the task's result
    pub id: Uuid,

    /// Registered task name
    pub task: String,

    /// Queue the message was published to
    pub queue: String,

    /// Encoded arguments
    pub payload: TaskPayload,

    /// Number of times this task has already been retried
    #[serde(default)]
    pub retries: u32,

    /// Earliest time the task may run
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,

    /// Time after which the task must not run
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl TaskMessage {
    /// Create a message for `task` with JSON-encoded arguments
    pub fn new(task: impl Into<String>, args: TaskArgs) -> Self {
        Self {
            id: Uuid::now_v7(),
            task: task.into(),
            queue: DEFAULT_QUEUE.to_string(),
            payload: TaskPayload::json(&args),
            retries: 0,
            eta: None,
            expires: None,
        }
    }

    /// Set the message id
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Set the target queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Replace the payload
    pub fn with_payload(mut self, payload: TaskPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the retry count
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Do not run before `eta`
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Do not run before `countdown` has elapsed
    pub fn with_countdown(self, countdown: Duration) -> Self {
        let now = Utc::now();
        let eta = chrono::Duration::from_std(countdown)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.with_eta(eta)
    }

    /// Do not run after `expires`
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Time left until the message's eta, if it lies in the future
    pub fn delay_until_eta(&self, now: DateTime<Utc>) -> Option<Duration> {
        let eta = self.eta?;
        eta.signed_duration_since(now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// Whether the message expired before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}
