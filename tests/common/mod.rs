#![allow(dead_code)]

use once_cell::sync::Lazy;
use remote_dev::errors::RemoteError;
use remote_dev::services::identity::{CredentialProvider, CredentialSet};
use remote_dev::transport::{
    Connection, ExecOutput, ForwardHandle, Target, Transport, TransportError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn tmp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

pub fn target() -> Target {
    Target::new("devbox", 22, "dev")
}

pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn exit(code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

type Responder = Box<dyn Fn(&str) -> ExecOutput + Send + Sync>;

/// Remote side double: answers commands through a test-supplied responder and
/// records everything it was asked to do.
pub struct FakeConnection {
    responder: Responder,
    pub commands: std::sync::Mutex<Vec<String>>,
    pub uploads: std::sync::Mutex<Vec<(PathBuf, String)>>,
    pub forwards: AtomicUsize,
    pub disconnects: AtomicUsize,
    listeners: std::sync::Mutex<Vec<std::net::TcpListener>>,
}

impl FakeConnection {
    pub fn new(responder: impl Fn(&str) -> ExecOutput + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            commands: std::sync::Mutex::new(Vec::new()),
            uploads: std::sync::Mutex::new(Vec::new()),
            forwards: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            listeners: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| ok(""))
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands").clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().expect("uploads").len()
    }
}

#[async_trait::async_trait]
impl Connection for FakeConnection {
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        self.commands
            .lock()
            .expect("commands")
            .push(command.to_string());
        Ok((self.responder)(command))
    }

    async fn forward_port(
        &self,
        local_port: u16,
        _remote_host: &str,
        _remote_port: u16,
    ) -> Result<ForwardHandle, TransportError> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", local_port))?;
        let port = listener.local_addr()?.port();
        self.listeners.lock().expect("listeners").push(listener);
        self.forwards.fetch_add(1, Ordering::SeqCst);
        Ok(ForwardHandle::untracked(port))
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), TransportError> {
        self.uploads
            .lock()
            .expect("uploads")
            .push((local_path.to_path_buf(), remote_path.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeTransport {
    pub connection: Arc<FakeConnection>,
    pub handshakes: AtomicUsize,
    pub fail_auth: AtomicBool,
    pub delay_ms: u64,
}

impl FakeTransport {
    pub fn new(connection: FakeConnection) -> Self {
        Self {
            connection: Arc::new(connection),
            handshakes: AtomicUsize::new(0),
            fail_auth: AtomicBool::new(false),
            delay_ms: 0,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        target: &Target,
        _credentials: &CredentialSet,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(TransportError::Authentication {
                user: target.username.clone(),
                reason: "no identity accepted".to_string(),
            });
        }
        let connection: Arc<dyn Connection> = self.connection.clone();
        Ok(connection)
    }
}

#[derive(Default)]
pub struct CountingCredentials {
    pub calls: AtomicUsize,
}

#[async_trait::async_trait]
impl CredentialProvider for CountingCredentials {
    async fn credentials(&self, _target: &Target) -> Result<CredentialSet, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CredentialSet::default())
    }
}
