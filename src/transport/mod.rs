mod libssh;

pub use libssh::Ssh2Transport;

use crate::errors::RemoteError;
use crate::services::identity::CredentialSet;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to reach {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("SSH handshake with {target} failed: {reason}")]
    Handshake { target: String, reason: String },
    #[error("authentication as {user} failed: {reason}")]
    Authentication { user: String, reason: String },
    #[error("SSH channel error: {0}")]
    Channel(String),
    #[error("SSH operation timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors raised before a session is usable; these fail the whole session.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::Handshake { .. }
                | TransportError::Authentication { .. }
        )
    }
}

impl From<TransportError> for RemoteError {
    fn from(err: TransportError) -> Self {
        match &err {
            TransportError::Authentication { user, .. } => {
                RemoteError::authentication(err.to_string())
                    .with_details(serde_json::json!({"user": user}))
            }
            TransportError::Timeout => RemoteError::timeout(err.to_string()),
            TransportError::Connect { target, .. } | TransportError::Handshake { target, .. } => {
                RemoteError::transport(err.to_string())
                    .with_details(serde_json::json!({"target": target}))
            }
            _ => RemoteError::transport(err.to_string()),
        }
    }
}

/// A live local listener forwarding to a remote address. Dropping it stops the forward.
#[derive(Debug)]
pub struct ForwardHandle {
    local_port: u16,
    task: Option<tokio::task::AbortHandle>,
    stop: Arc<AtomicBool>,
}

impl ForwardHandle {
    pub fn new(local_port: u16, task: tokio::task::AbortHandle, stop: Arc<AtomicBool>) -> Self {
        Self {
            local_port,
            task: Some(task),
            stop,
        }
    }

    /// For transports whose forwards have no local task to stop.
    pub fn untracked(local_port: u16) -> Self {
        Self {
            local_port,
            task: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Authenticates one link to a [`Target`] and hands back a [`Connection`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        target: &Target,
        credentials: &CredentialSet,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError>;

    async fn forward_port(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardHandle, TransportError>;

    async fn upload_file(&self, local_path: &Path, remote_path: &str)
        -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
