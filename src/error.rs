use std::borrow::Cow;

use crate::{
    codec::DecodeError,
    dispatcher::SessionMode,
    model::{ErrorData, JsonRpcMessage},
    session::SessionId,
};

/// Failures surfaced by the transport to the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid session: {0}")]
    InvalidSession(Cow<'static, str>),
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
    #[error("session {0} already has an open stream")]
    ChannelAlreadyOpen(SessionId),
    #[error("session {0} has no open stream")]
    StreamUnavailable(SessionId),
    #[error("operation not supported in {0} mode")]
    Unsupported(SessionMode),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn invalid_session(reason: impl Into<Cow<'static, str>>) -> Self {
        TransportError::InvalidSession(reason.into())
    }

    pub fn to_error_data(&self) -> ErrorData {
        match self {
            TransportError::InvalidSession(reason) => {
                ErrorData::invalid_session(format!("Bad Request: {reason}"))
            }
            TransportError::SessionClosed(_) => {
                ErrorData::invalid_session("Bad Request: session is closed")
            }
            TransportError::ChannelAlreadyOpen(_) => {
                ErrorData::invalid_session("Conflict: a stream is already open for this session")
            }
            TransportError::StreamUnavailable(_) => {
                ErrorData::invalid_session("Bad Request: session has no open stream")
            }
            TransportError::Unsupported(mode) => {
                ErrorData::invalid_session(format!("Method not allowed in {mode} mode"))
            }
            TransportError::Decode(e) => e.to_error_data(),
            TransportError::Internal(message) => {
                ErrorData::internal_error(message.clone(), None)
            }
        }
    }

    /// The JSON-RPC error envelope written as the HTTP body for this failure.
    pub fn to_message(&self) -> JsonRpcMessage {
        match self {
            TransportError::Decode(e) => e.to_message(),
            other => JsonRpcMessage::error(None, other.to_error_data()),
        }
    }
}
