use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    InvalidParams,
    Credential,
    Transport,
    Authentication,
    Command,
    Protocol,
    InstallFailed,
    Integrity,
    Unsupported,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RemoteError {
    pub fn new(
        kind: RemoteErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidParams, "INVALID_PARAMS", message)
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Credential, "CREDENTIAL", message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transport, "TRANSPORT", message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Authentication, "AUTH_FAILED", message)
    }

    pub fn command(command: &str, exit_code: i32, stderr: &str) -> Self {
        Self::new(
            RemoteErrorKind::Command,
            "COMMAND_FAILED",
            format!("Remote command exited with code {}", exit_code),
        )
        .with_details(serde_json::json!({
            "command": command,
            "exit_code": exit_code,
            "stderr": stderr.trim(),
        }))
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Protocol, "UNPARSABLE_INSTALL_OUTPUT", message)
    }

    pub fn install_failed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InstallFailed, "INSTALL_FAILED", message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Integrity, "SIZE_MISMATCH", message)
    }

    pub fn unsupported(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unsupported, code, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Internal, "INTERNAL", message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for RemoteError {}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::internal(err.to_string())
    }
}
