use std::{fmt, io};

/// Crate-wide `Result` type using [`AggError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, AggError>;

/// Server code for `CursorNotFound`.
pub const CURSOR_NOT_FOUND: i32 = 43;

/// Top-level error type for aggregation and cursor operations.
#[derive(Debug)]
pub enum AggError {
    /// Malformed request detected before any network activity.
    InvalidArgument(String),

    /// The server rejected a command.
    CommandFailed(CommandError),

    /// The channel could not deliver a command or receive its response.
    Transport(TransportError),

    /// The server no longer knows the cursor.
    CursorClosed(String),

    /// Configuration errors.
    Config(ConfigError),

    /// I/O errors.
    Io(io::Error),

    /// Generic error with a free-form message.
    Generic(String),
}

/// A command rejected by the server, carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Server error code.
    pub code: i32,

    /// Server error code name, e.g. `MaxTimeMSExpired`.
    pub code_name: Option<String>,

    /// Server error message.
    pub message: String,
}

/// Failure to move a command or response across the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Description of the failure.
    pub message: String,

    /// Whether the channel classified the failure as transient.
    pub retryable: bool,
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },
}

impl CommandError {
    pub fn new(code: i32, code_name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name,
            message: message.into(),
        }
    }
}

impl TransportError {
    /// A transient failure the cursor may retry once.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that ends the cursor.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl AggError {
    /// Whether the error is a transport failure classified as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AggError::Transport(TransportError { retryable: true, .. }))
    }

    /// Build the error for a server reply with `ok: 0`.
    ///
    /// `CursorNotFound` is reported as [`AggError::CursorClosed`].
    pub fn from_command_error(err: CommandError) -> Self {
        if err.code == CURSOR_NOT_FOUND {
            AggError::CursorClosed(err.message)
        } else {
            AggError::CommandFailed(err)
        }
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for AggError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            AggError::CommandFailed(e) => write!(f, "Command failed: {e}"),
            AggError::Transport(e) => write!(f, "Transport error: {e}"),
            AggError::CursorClosed(msg) => write!(f, "Cursor closed: {msg}"),
            AggError::Config(e) => write!(f, "Configuration error: {e}"),
            AggError::Io(e) => write!(f, "I/O error: {e}"),
            AggError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code_name {
            Some(name) => write!(f, "{} ({}): {}", name, self.code, self.message),
            None => write!(f, "code {}: {}", self.code, self.message),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.retryable {
            write!(f, "{} (retryable)", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl std::error::Error for AggError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AggError::Io(e) => Some(e),
            _ => None,
        }
    }
}
impl std::error::Error for CommandError {}
impl std::error::Error for TransportError {}
impl std::error::Error for ConfigError {}

/* ========================= Conversions to AggError ========================= */

impl From<io::Error> for AggError {
    fn from(err: io::Error) -> Self {
        AggError::Io(err)
    }
}

impl From<CommandError> for AggError {
    fn from(err: CommandError) -> Self {
        AggError::from_command_error(err)
    }
}

impl From<TransportError> for AggError {
    fn from(err: TransportError) -> Self {
        AggError::Transport(err)
    }
}

impl From<ConfigError> for AggError {
    fn from(err: ConfigError) -> Self {
        AggError::Config(err)
    }
}

impl From<String> for AggError {
    fn from(msg: String) -> Self {
        AggError::Generic(msg)
    }
}

impl From<&str> for AggError {
    fn from(msg: &str) -> Self {
        AggError::Generic(msg.to_owned())
    }
}
