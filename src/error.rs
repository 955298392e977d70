use rmcp::model::ErrorData;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum RedisOpsError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command blocked for safety: {0}")]
    SafetyViolation(String),

    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Redis error: {0}")]
    Command(String),
}

/// Error category reported to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    SafetyViolation,
    ConfirmationRequired,
    UnsupportedOperation,
    ValidationError,
    CommandError,
}

/// The `{kind, message}` shape every failed tool call carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl RedisOpsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RedisOpsError::Connection(_) => ErrorKind::ConnectionError,
            RedisOpsError::SafetyViolation(_) => ErrorKind::SafetyViolation,
            RedisOpsError::ConfirmationRequired(_) => ErrorKind::ConfirmationRequired,
            RedisOpsError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            RedisOpsError::Validation(_) => ErrorKind::ValidationError,
            RedisOpsError::Command(_) => ErrorKind::CommandError,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RedisOpsError::Connection(_))
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub fn to_mcp_error(&self) -> ErrorData {
        let data = serde_json::to_value(self.payload()).ok();
        match self {
            RedisOpsError::SafetyViolation(_)
            | RedisOpsError::ConfirmationRequired(_)
            | RedisOpsError::UnsupportedOperation(_)
            | RedisOpsError::Validation(_) => ErrorData::invalid_params(self.to_string(), data),
            RedisOpsError::Connection(_) | RedisOpsError::Command(_) => {
                ErrorData::internal_error(self.to_string(), data)
            }
        }
    }
}

impl From<redis::RedisError> for RedisOpsError {
    fn from(e: redis::RedisError) -> Self {
        // A demoted master answers READONLY after a sentinel failover; the
        // handle is pointing at the wrong node, not the command at fault.
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.kind() == redis::ErrorKind::ReadOnly
        {
            RedisOpsError::Connection(e.to_string())
        } else {
            RedisOpsError::Command(e.to_string())
        }
    }
}
