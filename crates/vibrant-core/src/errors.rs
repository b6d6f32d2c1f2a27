use crate::ids::RequestId;

/// Why a client id presented by a connecting agent was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientIdError {
    #[error("client id is empty")]
    Empty,
    #[error("client id is {len} bytes, max {max}")]
    TooLong { len: usize, max: usize },
    #[error("client id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// An inbound agent message that cannot be matched to a command.
///
/// None of these are fatal: the message is dropped and the connection stays up.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no 'type'")]
    MissingType,
    #[error("message has no 'requestId'")]
    MissingRequestId,
    #[error("unhandled message type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} body: {reason}")]
    InvalidBody { kind: &'static str, reason: String },
}

impl ReplyError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingType => "missing_type",
            Self::MissingRequestId => "missing_request_id",
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidBody { .. } => "invalid_body",
        }
    }

    /// Malformed messages lack the envelope fields needed for correlation.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::UnknownType(_))
    }
}

/// Broker-level failures. Timeouts are not errors; they are an await outcome.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("request id {0} already pending")]
    DuplicateRequest(RequestId),
    #[error("failed to encode command envelope: {0}")]
    Encode(String),
}

impl BrokerError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::Encode(_) => "encode",
        }
    }
}
