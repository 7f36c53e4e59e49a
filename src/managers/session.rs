use crate::errors::RemoteError;
use crate::services::identity::{CredentialProvider, CredentialSet};
use crate::services::logger::Logger;
use crate::transport::{Connection, ExecOutput, ForwardHandle, Target, Transport};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    pub name: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    #[default]
    Direct,
    Socks,
}

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub name: Option<String>,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub mode: TunnelMode,
}

impl TunnelSpec {
    pub fn new(remote_address: impl Into<String>, remote_port: u16) -> Self {
        Self {
            name: None,
            local_port: 0,
            remote_address: remote_address.into(),
            remote_port,
            mode: TunnelMode::Direct,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = local_port;
        self
    }

    pub fn with_mode(mut self, mode: TunnelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn resolved_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", self.remote_address, self.remote_port))
    }
}

struct Link {
    state: SessionState,
    connection: Option<Arc<dyn Connection>>,
    failure: Option<RemoteError>,
}

struct OpenTunnel {
    tunnel: Tunnel,
    forward: ForwardHandle,
}

struct SessionInner {
    target: Target,
    logger: Logger,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    // Lock order: tunnels before link.
    link: tokio::sync::Mutex<Link>,
    tunnels: tokio::sync::Mutex<HashMap<String, OpenTunnel>>,
    status: std::sync::Mutex<SessionState>,
}

/// One logical connection to a target. Clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.inner.target)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        target: Target,
        logger: Logger,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                target,
                logger,
                transport,
                credentials,
                link: tokio::sync::Mutex::new(Link {
                    state: SessionState::Disconnected,
                    connection: None,
                    failure: None,
                }),
                tunnels: tokio::sync::Mutex::new(HashMap::new()),
                status: std::sync::Mutex::new(SessionState::Disconnected),
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn state(&self) -> SessionState {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_state(&self, link: &mut Link, state: SessionState) {
        link.state = state;
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = state;
    }

    /// Connects with credentials from the session's credential provider.
    pub async fn connect(&self) -> Result<(), RemoteError> {
        self.establish(None).await.map(|_| ())
    }

    pub async fn connect_with(&self, credentials: &CredentialSet) -> Result<(), RemoteError> {
        self.establish(Some(credentials)).await.map(|_| ())
    }

    async fn establish(
        &self,
        credentials: Option<&CredentialSet>,
    ) -> Result<Arc<dyn Connection>, RemoteError> {
        let mut link = self.inner.link.lock().await;
        match link.state {
            SessionState::Connected => {
                if let Some(connection) = link.connection.clone() {
                    return Ok(connection);
                }
            }
            SessionState::Failed => {
                return Err(link.failure.clone().unwrap_or_else(|| {
                    RemoteError::transport("Session failed and must be recreated")
                }));
            }
            SessionState::Disconnected | SessionState::Connecting => {}
        }

        self.set_state(&mut link, SessionState::Connecting);
        let target = &self.inner.target;
        let credentials = match credentials {
            Some(credentials) => credentials.clone(),
            None => match self.inner.credentials.credentials(target).await {
                Ok(credentials) => credentials,
                Err(err) => {
                    self.set_state(&mut link, SessionState::Disconnected);
                    return Err(err);
                }
            },
        };

        self.inner.logger.info(
            "Connecting",
            Some(&serde_json::json!({
                "target": target.to_string(),
                "identities": credentials.len(),
            })),
        );
        match self.inner.transport.connect(target, &credentials).await {
            Ok(connection) => {
                link.connection = Some(connection.clone());
                link.failure = None;
                self.set_state(&mut link, SessionState::Connected);
                self.inner.logger.info(
                    "Connected",
                    Some(&serde_json::json!({"target": target.to_string()})),
                );
                Ok(connection)
            }
            Err(err) => {
                let failed = err.is_handshake_failure();
                let error = RemoteError::from(err);
                self.inner.logger.error(
                    "Connection failed",
                    Some(&serde_json::json!({"target": target.to_string(), "error": error.message})),
                );
                if failed {
                    link.failure = Some(error.clone());
                    self.set_state(&mut link, SessionState::Failed);
                } else {
                    self.set_state(&mut link, SessionState::Disconnected);
                }
                Err(error)
            }
        }
    }

    pub async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        let connection = self.establish(None).await?;
        self.inner.logger.debug(
            "exec",
            Some(&serde_json::json!({"command": first_line(command)})),
        );
        connection.exec(command).await.map_err(|err| {
            RemoteError::from(err).with_details(serde_json::json!({
                "target": self.inner.target.to_string(),
                "command": first_line(command),
            }))
        })
    }

    /// Like [`Session::exec`], but a non-zero exit status is an error.
    pub async fn exec_checked(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        let output = self.exec(command).await?;
        if !output.success() {
            return Err(RemoteError::command(
                first_line(command),
                output.exit_code,
                &output.stderr,
            ));
        }
        Ok(output)
    }

    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        let connection = self.establish(None).await?;
        connection
            .upload_file(local_path, remote_path)
            .await
            .map_err(|err| {
                RemoteError::from(err).with_details(serde_json::json!({
                    "local_path": local_path.display().to_string(),
                    "remote_path": remote_path,
                }))
            })
    }

    pub async fn add_tunnel(&self, spec: TunnelSpec) -> Result<Tunnel, RemoteError> {
        if spec.mode == TunnelMode::Socks {
            return Err(RemoteError::unsupported(
                "SOCKS_UNSUPPORTED",
                "Dynamic (socks) tunnels are not supported",
            ));
        }
        let name = spec.resolved_name();
        let mut tunnels = self.inner.tunnels.lock().await;
        if let Some(existing) = tunnels.get(&name) {
            return Ok(existing.tunnel.clone());
        }

        let connection = self.establish(None).await?;
        let forward = connection
            .forward_port(spec.local_port, &spec.remote_address, spec.remote_port)
            .await
            .map_err(RemoteError::from)?;
        let tunnel = Tunnel {
            name: name.clone(),
            local_port: forward.local_port(),
            remote_address: spec.remote_address,
            remote_port: spec.remote_port,
        };
        self.inner.logger.info(
            "Tunnel opened",
            Some(&serde_json::json!({
                "name": tunnel.name,
                "local_port": tunnel.local_port,
                "remote": format!("{}:{}", tunnel.remote_address, tunnel.remote_port),
            })),
        );
        tunnels.insert(
            name,
            OpenTunnel {
                tunnel: tunnel.clone(),
                forward,
            },
        );
        Ok(tunnel)
    }

    /// Closes the named tunnel, or every tunnel when `name` is `None`. Returns how many closed.
    pub async fn close_tunnel(&self, name: Option<&str>) -> usize {
        let mut tunnels = self.inner.tunnels.lock().await;
        let closing: Vec<OpenTunnel> = match name {
            Some(name) => tunnels.remove(name).into_iter().collect(),
            None => tunnels.drain().map(|(_, open)| open).collect(),
        };
        let count = closing.len();
        for open in closing {
            self.inner.logger.info(
                "Tunnel closed",
                Some(&serde_json::json!({"name": open.tunnel.name})),
            );
            open.forward.close();
        }
        count
    }

    pub async fn tunnels(&self) -> Vec<Tunnel> {
        let tunnels = self.inner.tunnels.lock().await;
        let mut out: Vec<Tunnel> = tunnels.values().map(|open| open.tunnel.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn close(&self) {
        let mut tunnels = self.inner.tunnels.lock().await;
        let mut link = self.inner.link.lock().await;
        for (_, open) in tunnels.drain() {
            open.forward.close();
        }
        if let Some(connection) = link.connection.take() {
            if let Err(err) = connection.disconnect().await {
                self.inner.logger.warn(
                    "Disconnect failed",
                    Some(&serde_json::json!({"target": self.inner.target.to_string(), "error": err.to_string()})),
                );
            }
        }
        if link.state != SessionState::Failed {
            self.set_state(&mut link, SessionState::Disconnected);
        }
        self.inner.logger.info(
            "Session closed",
            Some(&serde_json::json!({"target": self.inner.target.to_string()})),
        );
    }
}

/// Arena of sessions, one per target.
pub struct SessionManager {
    logger: Logger,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    sessions: DashMap<Target, Session>,
}

impl SessionManager {
    pub fn new(
        logger: Logger,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            logger: logger.child("session"),
            transport,
            credentials,
            sessions: DashMap::new(),
        }
    }

    pub fn session(&self, target: &Target) -> Session {
        self.sessions
            .entry(target.clone())
            .or_insert_with(|| {
                Session::new(
                    target.clone(),
                    self.logger.clone(),
                    self.transport.clone(),
                    self.credentials.clone(),
                )
            })
            .value()
            .clone()
    }

    pub async fn connect(
        &self,
        target: &Target,
        credentials: &CredentialSet,
    ) -> Result<Session, RemoteError> {
        let session = self.session(target);
        session.connect_with(credentials).await?;
        Ok(session)
    }

    pub async fn open(&self, target: &Target) -> Result<Session, RemoteError> {
        let session = self.session(target);
        session.connect().await?;
        Ok(session)
    }

    /// Drops a session from the arena so the next lookup starts fresh.
    pub fn discard(&self, target: &Target) -> Option<Session> {
        self.sessions.remove(target).map(|(_, session)| session)
    }

    pub fn targets(&self) -> Vec<Target> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.close().await;
        }
    }
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or("").trim()
}
