//! Decoding and encoding of JSON-RPC 2.0 payloads.
//!
//! A request body is either a single envelope or a batch (a JSON array of
//! envelopes). Batch elements are classified independently, so one malformed
//! element never fails its siblings.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::{
    ErrorData, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};

/// Failure to turn raw bytes into envelopes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty batch")]
    EmptyBatch,
    #[error("invalid envelope: {reason}")]
    Envelope {
        /// The envelope's id, when it could be read.
        id: Option<RequestId>,
        reason: String,
    },
}

impl DecodeError {
    fn envelope(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        DecodeError::Envelope {
            id,
            reason: reason.into(),
        }
    }

    /// The id to echo in the error reply, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            DecodeError::Envelope { id, .. } => id.as_ref(),
            _ => None,
        }
    }

    pub fn to_error_data(&self) -> ErrorData {
        match self {
            DecodeError::Json(e) => ErrorData::parse_error(format!("Parse error: {e}")),
            DecodeError::EmptyBatch => ErrorData::invalid_request("Invalid Request: empty batch"),
            DecodeError::Envelope { reason, .. } => {
                ErrorData::invalid_params(format!("Invalid envelope: {reason}"), None)
            }
        }
    }

    /// The JSON-RPC error reply describing this failure.
    pub fn to_message(&self) -> JsonRpcMessage {
        JsonRpcMessage::error(self.request_id().cloned(), self.to_error_data())
    }
}

/// A decoded request body.
#[derive(Debug)]
pub enum Payload {
    Single(JsonRpcMessage),
    Batch(Vec<Result<JsonRpcMessage, DecodeError>>),
}

impl Payload {
    pub fn is_batch(&self) -> bool {
        matches!(self, Payload::Batch(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the payload into per-envelope decode results.
    pub fn into_items(self) -> Vec<Result<JsonRpcMessage, DecodeError>> {
        match self {
            Payload::Single(message) => vec![Ok(message)],
            Payload::Batch(items) => items,
        }
    }
}

/// Decodes a request body.
///
/// Returns `Err` only when the body as a whole is unusable: invalid JSON, an
/// empty batch, or a single envelope that cannot be classified.
pub fn decode(body: &[u8]) -> Result<Payload, DecodeError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(DecodeError::EmptyBatch);
            }
            Ok(Payload::Batch(items.into_iter().map(classify).collect()))
        }
        value => classify(value).map(Payload::Single),
    }
}

/// Classifies one JSON value as exactly one envelope kind.
///
/// Rules, in order: `method` with `id` is a request, `method` without `id` is
/// a notification, `id` with exactly one of `result`/`error` is a response.
pub fn classify(value: Value) -> Result<JsonRpcMessage, DecodeError> {
    let Value::Object(object) = value else {
        return Err(DecodeError::envelope(None, "envelope must be a JSON object"));
    };
    let id = recover_id(&object);

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == "2.0" => {}
        Some(_) => return Err(DecodeError::envelope(id, "jsonrpc must be \"2.0\"")),
        None => return Err(DecodeError::envelope(id, "missing jsonrpc member")),
    }

    let has_method = object.contains_key("method");
    let has_id = object.contains_key("id");
    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    let value = Value::Object(object);
    let parsed = if has_method && has_id {
        serde_json::from_value::<JsonRpcRequest>(value).map(JsonRpcMessage::Request)
    } else if has_method {
        serde_json::from_value::<JsonRpcNotification>(value).map(JsonRpcMessage::Notification)
    } else if has_id && has_result && !has_error {
        serde_json::from_value::<JsonRpcResponse>(value).map(JsonRpcMessage::Response)
    } else if has_id && has_error && !has_result {
        serde_json::from_value::<JsonRpcError>(value).map(JsonRpcMessage::Error)
    } else {
        return Err(DecodeError::envelope(
            id,
            "envelope is neither a request, a notification nor a response",
        ));
    };

    let message = parsed.map_err(|e| DecodeError::envelope(id.clone(), e.to_string()))?;
    if let Some(params) = request_params(&message)
        && !(params.is_object() || params.is_array())
    {
        return Err(DecodeError::envelope(id, "params must be an object or an array"));
    }
    Ok(message)
}

fn request_params(message: &JsonRpcMessage) -> Option<&Value> {
    match message {
        JsonRpcMessage::Request(r) => r.params.as_ref(),
        JsonRpcMessage::Notification(n) => n.params.as_ref(),
        _ => None,
    }
}

fn recover_id(object: &Map<String, Value>) -> Option<RequestId> {
    object
        .get("id")
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

/// Encodes one envelope.
pub fn encode(message: &JsonRpcMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Encodes a buffered reply, which is a single envelope or a batch.
pub fn encode_reply<T: Serialize + ?Sized>(reply: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(reply)
}
