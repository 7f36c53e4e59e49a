use crate::errors::RemoteError;
use crate::managers::artifact::{ArtifactConfig, ArtifactResolver, ServerMetadata};
use crate::managers::provision::{InstallOptions, Provisioner};
use crate::managers::session::{SessionManager, Tunnel, TunnelSpec};
use crate::services::identity::{IdentityRequest, IdentityResolver};
use crate::services::logger::Logger;
use crate::transport::{Ssh2Transport, Target};
use crate::utils::install_output::{InstallResult, ListeningOn};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub target: Target,
    pub identity: IdentityRequest,
    pub server: ServerMetadata,
    pub artifacts: ArtifactConfig,
    pub extensions: Vec<String>,
    pub env_vars: Vec<String>,
    pub use_socket: bool,
    pub local_port: u16,
    pub ready_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub target: Target,
    pub install: InstallResult,
    pub tunnel: Option<Tunnel>,
}

pub struct App {
    pub logger: Logger,
    pub sessions: Arc<SessionManager>,
    provisioner: Provisioner,
    config: AppConfig,
}

impl App {
    pub fn initialize(config: AppConfig) -> Result<Self, RemoteError> {
        let logger = Logger::new("remote-dev");
        let credentials = Arc::new(IdentityResolver::new(logger.clone(), config.identity.clone()));
        let transport = Arc::new(
            Ssh2Transport::new(logger.clone())
                .with_ready_timeout_ms(config.ready_timeout_ms)
                .with_agent_socket(config.identity.agent_socket.clone()),
        );
        let sessions = Arc::new(SessionManager::new(logger.clone(), transport, credentials));

        let progress_logger = logger.child("download");
        let artifacts = ArtifactResolver::new(logger.clone(), config.artifacts.clone())?
            .with_progress(Arc::new(move |pct: u8| {
                if pct % 10 == 0 {
                    progress_logger.info("progress", Some(&serde_json::json!({"percent": pct})));
                }
            }));
        let provisioner = Provisioner::new(logger.clone(), artifacts);

        Ok(Self {
            logger,
            sessions,
            provisioner,
            config,
        })
    }

    /// Connects, provisions the server and forwards its port to the local machine.
    pub async fn run(&self) -> Result<RunReport, RemoteError> {
        let target = &self.config.target;
        let session = self.sessions.open(target).await?;

        let mut options = InstallOptions::new(self.config.server.clone());
        options.extensions = self.config.extensions.clone();
        options.env_vars = self.config.env_vars.clone();
        options.use_socket = self.config.use_socket;
        let install = self.provisioner.install(&session, &options).await?;

        let tunnel = match &install.listening_on {
            Some(ListeningOn::Port(port)) => Some(
                session
                    .add_tunnel(
                        TunnelSpec::new("127.0.0.1", *port)
                            .with_name("server")
                            .with_local_port(self.config.local_port),
                    )
                    .await?,
            ),
            Some(ListeningOn::Socket(path)) => {
                self.logger.warn(
                    "Server listens on a unix socket; no TCP tunnel opened",
                    Some(&serde_json::json!({"socket": path})),
                );
                None
            }
            None => None,
        };

        Ok(RunReport {
            target: target.clone(),
            install,
            tunnel,
        })
    }

    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
    }
}
