use crate::errors::RemoteError;
use crate::managers::artifact::{detect_platform, ArtifactResolver, ServerArtifact, ServerMetadata};
use crate::managers::session::Session;
use crate::services::logger::Logger;
use crate::utils::install_output::{parse_install_output, InstallResult};
use crate::utils::install_script::{build_install_script, validate_env_var_name, InstallScriptParams};
use crate::utils::shell::{escape_shell_value, sh_command};

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub install_id: String,
    pub server: ServerMetadata,
    pub extensions: Vec<String>,
    pub env_vars: Vec<String>,
    pub use_socket: bool,
}

impl InstallOptions {
    pub fn new(server: ServerMetadata) -> Self {
        Self {
            install_id: uuid::Uuid::new_v4().simple().to_string(),
            server,
            extensions: Vec::new(),
            env_vars: Vec::new(),
            use_socket: false,
        }
    }
}

pub struct Provisioner {
    logger: Logger,
    artifacts: ArtifactResolver,
}

impl Provisioner {
    pub fn new(logger: Logger, artifacts: ArtifactResolver) -> Self {
        Self {
            logger: logger.child("provision"),
            artifacts,
        }
    }

    pub async fn is_installed(
        &self,
        session: &Session,
        server: &ServerMetadata,
    ) -> Result<bool, RemoteError> {
        let command = server
            .remote_binary_paths()
            .iter()
            .map(|path| format!("test -f \"$HOME\"/{}", escape_shell_value(path)))
            .collect::<Vec<_>>()
            .join(" || ");
        Ok(session.exec(&command).await?.success())
    }

    /// Installs the server if needed, starts it if not running, and reports where it listens.
    pub async fn install(
        &self,
        session: &Session,
        options: &InstallOptions,
    ) -> Result<InstallResult, RemoteError> {
        for name in &options.env_vars {
            validate_env_var_name(name)?;
        }
        let server = &options.server;

        let artifact: Option<ServerArtifact> = if self.is_installed(session, server).await? {
            self.logger.info(
                "Server already installed",
                Some(&serde_json::json!({"commit": server.commit})),
            );
            None
        } else {
            let arch = detect_platform(session).await?;
            let artifact = self.artifacts.resolve_remote(session, server, arch).await?;
            self.logger.info(
                "Server archive ready",
                Some(&serde_json::json!({
                    "source": artifact.source_kind,
                    "location": artifact.location,
                    "bytes": artifact.expected_size_bytes,
                })),
            );
            Some(artifact)
        };

        let connection_token = uuid::Uuid::new_v4().to_string();
        let script = build_install_script(&InstallScriptParams {
            install_id: &options.install_id,
            server,
            archive_path: artifact.as_ref().map(|a| a.location.as_str()),
            connection_token: &connection_token,
            extensions: &options.extensions,
            env_vars: &options.env_vars,
            use_socket: options.use_socket,
        })?;

        self.logger.info(
            "Running install script",
            Some(&serde_json::json!({
                "install_id": options.install_id,
                "target": session.target().to_string(),
            })),
        );
        let output = session.exec(&sh_command(&script)).await?;
        let result = parse_install_output(&output.stdout, &options.install_id, &options.env_vars)
            .map_err(|err| {
                err.with_details(serde_json::json!({
                    "install_id": options.install_id,
                    "exit_code": output.exit_code,
                    "stderr": output.stderr.trim(),
                }))
            })?;

        if result.exit_code != 0 {
            self.logger.error(
                "Install failed",
                Some(&serde_json::json!({"exit_code": result.exit_code, "log_file": result.log_file})),
            );
            return Err(RemoteError::install_failed(format!(
                "Server install exited with code {}",
                result.exit_code
            ))
            .with_details(serde_json::json!({
                "exit_code": result.exit_code,
                "log_file": result.log_file,
                "platform": result.platform,
                "arch": result.arch,
            })));
        }
        if result.listening_on.is_none() {
            return Err(RemoteError::protocol(
                "Could not parse install output: listeningOn missing",
            ));
        }

        self.logger.info(
            "Server listening",
            Some(&serde_json::json!({"listening_on": result.listening_on})),
        );
        Ok(result)
    }
}
