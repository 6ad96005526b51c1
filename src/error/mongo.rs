use serde::{Deserialize, Serialize};

use super::kinds::{AggError, CommandError, TransportError};

/// Structured error information, serialized to JSON by the CLI.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub(crate) error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) retryable: Option<bool>,
}

impl ErrorInfo {
    /// Convert error info to pretty-printed JSON string.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Convert error info to compact JSON string (single line).
    pub fn to_json_compact(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Extract structured information from a crate error.
pub fn extract_error_info(error: &AggError) -> ErrorInfo {
    let mut info = ErrorInfo::default();

    match error {
        AggError::InvalidArgument(msg) => {
            info.error_type = Some("aggcursor.invalid_argument".to_string());
            info.message = Some(msg.clone());
        }
        AggError::CommandFailed(cmd) => {
            info.error_type = Some("aggcursor.command_failed".to_string());
            info.code = Some(cmd.code);
            info.name = cmd.code_name.clone().or_else(|| get_error_name(cmd.code));
            info.message = Some(cmd.message.clone());
        }
        AggError::Transport(t) => {
            info.error_type = Some("aggcursor.transport_error".to_string());
            info.message = Some(t.message.clone());
            info.retryable = Some(t.retryable);
        }
        AggError::CursorClosed(msg) => {
            info.error_type = Some("aggcursor.cursor_closed".to_string());
            info.code = Some(super::kinds::CURSOR_NOT_FOUND);
            info.name = get_error_name(super::kinds::CURSOR_NOT_FOUND);
            info.message = Some(msg.clone());
        }
        other => {
            info.message = Some(other.to_string());
        }
    }

    info
}

/// Get a human-readable error name from a server error code.
fn get_error_name(code: i32) -> Option<String> {
    let name = match code {
        2 => "BadValue",
        13 => "Unauthorized",
        26 => "NamespaceNotFound",
        40 => "ConflictingUpdateOperators",
        43 => "CursorNotFound",
        50 => "MaxTimeMSExpired",
        136 => "CappedPositionLost",
        237 => "CursorKilled",
        _ => return None,
    };

    Some(name.to_string())
}

/// Classify a driver error into the crate taxonomy.
///
/// Socket-level failures and pool clears are transient; server replies keep
/// their code and message verbatim.
impl From<mongodb::error::Error> for AggError {
    fn from(error: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        match error.kind.as_ref() {
            ErrorKind::Command(command_error) => AggError::from(CommandError::new(
                command_error.code,
                Some(command_error.code_name.clone()).filter(|n| !n.is_empty()),
                command_error.message.clone(),
            )),
            ErrorKind::InvalidArgument { message, .. } => {
                AggError::InvalidArgument(message.clone())
            }
            ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
                AggError::Transport(TransportError::retryable(error.to_string()))
            }
            _ => AggError::Transport(TransportError::fatal(error.to_string())),
        }
    }
}
