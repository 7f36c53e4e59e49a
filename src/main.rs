use clap::{ArgAction, Parser};
use remote_dev::app::{App, AppConfig};
use remote_dev::constants::{artifact, install, network};
use remote_dev::errors::RemoteError;
use remote_dev::managers::artifact::{ArtifactConfig, ArtifactMode, ServerMetadata};
use remote_dev::services::identity::IdentityRequest;
use remote_dev::transport::Target;
use remote_dev::utils::paths::{remote_cache_dir, resolve_agent_socket, resolve_cache_dir, resolve_dist_dir};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "remote-dev", version, about = "Provision a remote development server over SSH")]
struct Cli {
    /// Remote host name or address.
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = network::SSH_DEFAULT_PORT)]
    port: u16,
    #[arg(long, short = 'u')]
    user: Option<String>,
    /// Private key file; repeatable. Defaults to the conventional ~/.ssh names.
    #[arg(long = "identity-file", short = 'i', action = ArgAction::Append)]
    identity_files: Vec<String>,
    #[arg(long)]
    identities_only: bool,
    #[arg(long)]
    agent_socket: Option<PathBuf>,

    #[arg(long = "server-version")]
    server_version: String,
    #[arg(long)]
    commit: String,
    #[arg(long, default_value = "stable")]
    quality: String,
    #[arg(long, default_value = install::DEFAULT_APP_NAME)]
    app_name: String,
    #[arg(long, default_value = install::DEFAULT_DATA_FOLDER)]
    data_folder: String,

    #[arg(long, default_value = artifact::DEFAULT_DOWNLOAD_HOST)]
    download_host: String,
    /// `owner/name` of the release repository.
    #[arg(long)]
    download_repo: String,
    #[arg(long, default_value = artifact::DEFAULT_ARTIFACT_TEMPLATE)]
    artifact_template: String,
    #[arg(long)]
    dist_dir: Option<PathBuf>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Download the archive on the remote host instead of uploading it.
    #[arg(long)]
    remote_download: bool,

    #[arg(long)]
    socket: bool,
    #[arg(long = "extension", action = ArgAction::Append)]
    extensions: Vec<String>,
    #[arg(long = "env", action = ArgAction::Append)]
    env_vars: Vec<String>,
    #[arg(long, default_value_t = 0)]
    local_port: u16,
    #[arg(long, default_value_t = network::TIMEOUT_SSH_READY_MS)]
    ready_timeout_ms: u64,
}

impl Cli {
    fn into_config(self) -> Result<AppConfig, RemoteError> {
        let username = match self.user {
            Some(user) => user,
            None => std::env::var("USER")
                .ok()
                .filter(|user| !user.trim().is_empty())
                .ok_or_else(|| {
                    RemoteError::invalid_params("No remote user given")
                        .with_hint("Pass --user or set USER.")
                })?,
        };

        let mut server = ServerMetadata::new(self.server_version, self.commit);
        server.quality = self.quality;
        server.app_name = self.app_name;
        server.data_folder = self.data_folder;

        let artifacts = ArtifactConfig {
            dist_dir: self.dist_dir.or_else(resolve_dist_dir),
            cache_dir: self.cache_dir.unwrap_or_else(resolve_cache_dir),
            remote_cache_dir: remote_cache_dir(&server.data_folder),
            download_host: self.download_host,
            download_repo: self.download_repo,
            artifact_template: self.artifact_template,
            mode: if self.remote_download {
                ArtifactMode::DownloadOnRemote
            } else {
                ArtifactMode::UploadFromLocal
            },
        };

        Ok(AppConfig {
            target: Target::new(self.host, self.port, username),
            identity: IdentityRequest {
                identity_files: self.identity_files,
                agent_socket: self.agent_socket.or_else(resolve_agent_socket),
                identities_only: self.identities_only,
            },
            server,
            artifacts,
            extensions: self.extensions,
            env_vars: self.env_vars,
            use_socket: self.socket,
            local_port: self.local_port,
            ready_timeout_ms: self.ready_timeout_ms,
        })
    }
}

async fn run(cli: Cli) -> Result<(), RemoteError> {
    let app = App::initialize(cli.into_config()?)?;
    let report = match app.run().await {
        Ok(report) => report,
        Err(err) => {
            app.shutdown().await;
            return Err(err);
        }
    };
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| RemoteError::internal(err.to_string()))?;
    println!("{}", rendered);

    if report.tunnel.is_some() {
        app.logger.info("Holding tunnel open; press Ctrl-C to exit", None);
        tokio::signal::ctrl_c().await?;
    }
    app.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("remote-dev: {}", err);
        if let Some(hint) = &err.hint {
            eprintln!("hint: {}", hint);
        }
        std::process::exit(1);
    }
}
