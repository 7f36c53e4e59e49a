use crate::constants::artifact::{
    CACHE_KEY_HEX_LEN, DEFAULT_ARTIFACT_TEMPLATE, DEFAULT_DOWNLOAD_HOST, MAX_REDIRECTS,
    MAX_TRANSFER_ATTEMPTS, NO_DOWNLOADER_MARKER,
};
use crate::constants::install::{DEFAULT_APP_NAME, DEFAULT_DATA_FOLDER, DEFAULT_FALLBACK_BINARIES};
use crate::errors::RemoteError;
use crate::managers::session::Session;
use crate::services::logger::Logger;
use crate::utils::fs_atomic::{ensure_dir_for_file, file_size, remove_if_exists, temp_sibling_path};
use crate::utils::paths::{remote_cache_dir, resolve_cache_dir, resolve_dist_dir};
use crate::utils::progress::{parse_progress_percentages, percent_of};
use crate::utils::shell::{escape_shell_value, parent_dir, sh_command};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Identity of the server build being provisioned.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetadata {
    pub version: String,
    pub commit: String,
    pub quality: String,
    pub app_name: String,
    pub data_folder: String,
    pub fallback_binaries: Vec<String>,
}

impl ServerMetadata {
    pub fn new(version: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            commit: commit.into(),
            quality: "stable".to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            data_folder: DEFAULT_DATA_FOLDER.to_string(),
            fallback_binaries: DEFAULT_FALLBACK_BINARIES
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }

    /// Server binary paths relative to the remote home directory, primary name first.
    pub fn remote_binary_paths(&self) -> Vec<String> {
        let bin_dir = format!(
            "{}/bin/{}/bin",
            self.data_folder.trim_end_matches('/'),
            self.commit
        );
        std::iter::once(&self.app_name)
            .chain(self.fallback_binaries.iter())
            .map(|name| format!("{}/{}", bin_dir, name))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_os(raw: &str) -> Result<(), RemoteError> {
    let os = raw.trim();
    if os.eq_ignore_ascii_case("linux") {
        return Ok(());
    }
    Err(RemoteError::unsupported(
        "UNSUPPORTED_PLATFORM",
        format!("Unsupported remote platform: {}", os),
    )
    .with_hint("Only Linux remote hosts are supported.")
    .with_details(serde_json::json!({"platform": os})))
}

pub fn parse_arch(raw: &str) -> Result<Arch, RemoteError> {
    match raw.trim() {
        "x86_64" | "amd64" => Ok(Arch::X64),
        "aarch64" | "arm64" => Ok(Arch::Arm64),
        other => Err(RemoteError::unsupported(
            "UNSUPPORTED_ARCH",
            format!("Unsupported remote architecture: {}", other),
        )
        .with_details(serde_json::json!({"arch": other}))),
    }
}

/// Runs `uname` on the remote host and maps the result to a supported architecture.
pub async fn detect_platform(session: &Session) -> Result<Arch, RemoteError> {
    let output = session.exec_checked("uname -s; uname -m").await?;
    let mut lines = output.stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let (Some(os), Some(machine)) = (lines.next(), lines.next()) else {
        return Err(RemoteError::protocol(format!(
            "Unexpected uname output: {}",
            output.stdout.trim()
        )));
    };
    parse_os(os)?;
    parse_arch(machine)
}

pub fn cache_key_file_name(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("server-{}.tar.gz", &digest[..CACHE_KEY_HEX_LEN])
}

pub fn dist_file_name(arch: Arch, version: &str) -> String {
    format!("{}-{}.tar.gz", arch, version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    LocalDist,
    LocalCache,
    RemoteCache,
    Download,
    RemoteDownload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerArtifact {
    pub source_kind: ArtifactSource,
    pub location: String,
    pub expected_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactMode {
    #[default]
    UploadFromLocal,
    DownloadOnRemote,
}

#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub dist_dir: Option<PathBuf>,
    pub cache_dir: PathBuf,
    /// Relative to the remote home directory.
    pub remote_cache_dir: String,
    /// Host name, or a full `http(s)://` origin.
    pub download_host: String,
    pub download_repo: String,
    pub artifact_template: String,
    pub mode: ArtifactMode,
}

impl ArtifactConfig {
    pub fn from_env(server: &ServerMetadata, download_repo: impl Into<String>) -> Self {
        Self {
            dist_dir: resolve_dist_dir(),
            cache_dir: resolve_cache_dir(),
            remote_cache_dir: remote_cache_dir(&server.data_folder),
            download_host: DEFAULT_DOWNLOAD_HOST.to_string(),
            download_repo: download_repo.into(),
            artifact_template: DEFAULT_ARTIFACT_TEMPLATE.to_string(),
            mode: ArtifactMode::UploadFromLocal,
        }
    }
}

pub type ProgressFn = dyn Fn(u8) + Send + Sync;

/// Finds the server archive in the first source that has it: the dist directory,
/// a local or remote cache keyed by download URL, or the network. Anything copied
/// to the remote host is size-verified after transfer.
pub struct ArtifactResolver {
    logger: Logger,
    config: ArtifactConfig,
    http: Client,
    progress: Option<Arc<ProgressFn>>,
}

impl ArtifactResolver {
    pub fn new(logger: Logger, config: ArtifactConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| RemoteError::internal(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            logger: logger.child("artifact"),
            config,
            http,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: Arc<ProgressFn>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn download_url(&self, server: &ServerMetadata, arch: Arch) -> String {
        let artifact = self
            .config
            .artifact_template
            .replace("{arch}", arch.as_str())
            .replace("{version}", &server.version)
            .replace("{app}", &server.app_name);
        let host = self.config.download_host.trim_end_matches('/');
        let origin = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };
        format!(
            "{}/{}/releases/download/v{}/{}",
            origin,
            self.config.download_repo.trim_matches('/'),
            server.version,
            artifact
        )
    }

    pub fn remote_cache_path(&self, url: &str) -> String {
        format!(
            "{}/{}",
            self.config.remote_cache_dir.trim_end_matches('/'),
            cache_key_file_name(url)
        )
    }

    fn report(&self, pct: u8) {
        self.logger
            .debug("progress", Some(&serde_json::json!({"percent": pct})));
        if let Some(progress) = &self.progress {
            progress(pct);
        }
    }

    async fn dist_archive(&self, server: &ServerMetadata, arch: Arch) -> Result<Option<(PathBuf, u64)>, RemoteError> {
        let Some(dir) = &self.config.dist_dir else {
            return Ok(None);
        };
        let path = dir.join(dist_file_name(arch, &server.version));
        Ok(file_size(&path).await?.map(|size| (path, size)))
    }

    /// Makes the archive available on the local machine.
    pub async fn resolve_local(
        &self,
        server: &ServerMetadata,
        arch: Arch,
    ) -> Result<ServerArtifact, RemoteError> {
        if let Some((path, size)) = self.dist_archive(server, arch).await? {
            self.logger.info(
                "Using dist archive",
                Some(&serde_json::json!({"path": path.display().to_string()})),
            );
            return Ok(local_artifact(ArtifactSource::LocalDist, &path, size));
        }

        let url = self.download_url(server, arch);
        let cached = self.config.cache_dir.join(cache_key_file_name(&url));
        if let Some(size) = file_size(&cached).await? {
            self.logger.info(
                "Using cached archive",
                Some(&serde_json::json!({"path": cached.display().to_string()})),
            );
            return Ok(local_artifact(ArtifactSource::LocalCache, &cached, size));
        }

        let size = self.download_to(&url, &cached).await?;
        Ok(local_artifact(ArtifactSource::Download, &cached, size))
    }

    /// Makes the archive available on the remote host; `location` is a remote path.
    pub async fn resolve_remote(
        &self,
        session: &Session,
        server: &ServerMetadata,
        arch: Arch,
    ) -> Result<ServerArtifact, RemoteError> {
        let url = self.download_url(server, arch);
        let remote_path = self.remote_cache_path(&url);

        if let Some((path, _)) = self.dist_archive(server, arch).await? {
            let size = self.upload_verified(session, &path, &remote_path).await?;
            return Ok(remote_artifact(ArtifactSource::LocalDist, remote_path, Some(size)));
        }

        if let Some(size) = remote_file_size(session, &remote_path).await? {
            self.logger.info(
                "Using remote cached archive",
                Some(&serde_json::json!({"path": remote_path, "bytes": size})),
            );
            return Ok(remote_artifact(ArtifactSource::RemoteCache, remote_path, Some(size)));
        }

        match self.config.mode {
            ArtifactMode::UploadFromLocal => {
                let local = self.resolve_local(server, arch).await?;
                let size = self
                    .upload_verified(session, Path::new(&local.location), &remote_path)
                    .await?;
                Ok(remote_artifact(local.source_kind, remote_path, Some(size)))
            }
            ArtifactMode::DownloadOnRemote => {
                let size = self.remote_download(session, &url, &remote_path).await?;
                Ok(remote_artifact(ArtifactSource::RemoteDownload, remote_path, size))
            }
        }
    }

    /// Uploads and checks the remote size, retrying once on mismatch.
    pub async fn upload_verified(
        &self,
        session: &Session,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<u64, RemoteError> {
        let expected = file_size(local_path).await?.ok_or_else(|| {
            RemoteError::invalid_params(format!(
                "Archive not found: {}",
                local_path.display()
            ))
        })?;

        let mut observed: Vec<u64> = Vec::new();
        for attempt in 1..=MAX_TRANSFER_ATTEMPTS {
            self.logger.info(
                "Uploading archive",
                Some(&serde_json::json!({
                    "local_path": local_path.display().to_string(),
                    "remote_path": remote_path,
                    "bytes": expected,
                    "attempt": attempt,
                })),
            );
            session.upload_file(local_path, remote_path).await?;
            let size = remote_file_size(session, remote_path).await?.unwrap_or(0);
            if size == expected {
                return Ok(expected);
            }
            self.logger.warn(
                "Uploaded size mismatch",
                Some(&serde_json::json!({
                    "remote_path": remote_path,
                    "expected_bytes": expected,
                    "observed_bytes": size,
                    "attempt": attempt,
                })),
            );
            observed.push(size);
        }

        Err(RemoteError::integrity(format!(
            "Uploaded archive size mismatch for {}: expected {} bytes, observed {:?}",
            remote_path, expected, observed
        ))
        .with_details(serde_json::json!({
            "remote_path": remote_path,
            "expected_bytes": expected,
            "observed_bytes": observed,
        })))
    }

    /// Downloads `url` into `dest`, following 301/302 manually.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, RemoteError> {
        let mut current = ::url::Url::parse(url)
            .map_err(|err| RemoteError::invalid_params(format!("Invalid download URL {}: {}", url, err)))?;
        ensure_dir_for_file(dest).await?;

        for _ in 0..=MAX_REDIRECTS {
            self.logger.info(
                "Downloading archive",
                Some(&serde_json::json!({"url": current.as_str()})),
            );
            let response = self
                .http
                .get(current.clone())
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let status = response.status();
            if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        RemoteError::transport(format!(
                            "Redirect from {} without Location header",
                            current
                        ))
                    })?;
                current = current.join(location).map_err(|err| {
                    RemoteError::transport(format!("Invalid redirect target {}: {}", location, err))
                })?;
                continue;
            }
            if !status.is_success() {
                return Err(RemoteError::transport(format!(
                    "Download of {} failed with HTTP {}",
                    current,
                    status.as_u16()
                ))
                .with_details(serde_json::json!({
                    "url": current.as_str(),
                    "status": status.as_u16(),
                })));
            }

            let tmp = temp_sibling_path(dest);
            return match self.stream_to_file(response, &tmp).await {
                Ok(bytes) => {
                    tokio::fs::rename(&tmp, dest).await.map_err(|err| {
                        RemoteError::internal(format!("Failed to finalize download: {}", err))
                    })?;
                    self.logger.info(
                        "Download complete",
                        Some(&serde_json::json!({
                            "path": dest.display().to_string(),
                            "bytes": bytes,
                        })),
                    );
                    Ok(bytes)
                }
                Err(err) => {
                    let _ = remove_if_exists(&tmp).await;
                    Err(err)
                }
            };
        }

        Err(RemoteError::transport(format!(
            "Too many redirects while downloading {}",
            url
        )))
    }

    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        path: &Path,
    ) -> Result<u64, RemoteError> {
        let total = response.content_length();
        let mut file = tokio::fs::File::create(path).await.map_err(|err| {
            RemoteError::internal(format!("Failed to create download file: {}", err))
        })?;
        let mut stream = response.bytes_stream();
        let mut bytes: u64 = 0;
        let mut last_pct: Option<u8> = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|err| {
                RemoteError::internal(format!("Failed to write download chunk: {}", err))
            })?;
            let pct = percent_of(bytes, total);
            if pct.is_some() && pct != last_pct {
                last_pct = pct;
                if let Some(pct) = pct {
                    self.report(pct);
                }
            }
        }
        file.flush().await?;
        Ok(bytes)
    }

    async fn remote_download(
        &self,
        session: &Session,
        url: &str,
        remote_path: &str,
    ) -> Result<Option<u64>, RemoteError> {
        self.logger.info(
            "Downloading archive on remote host",
            Some(&serde_json::json!({"url": url, "remote_path": remote_path})),
        );
        let script = remote_download_script(url, remote_path);
        let output = session.exec(&sh_command(&script)).await?;
        if output.stdout.contains(NO_DOWNLOADER_MARKER) {
            return Err(RemoteError::unsupported(
                "NO_DOWNLOADER",
                "Neither curl nor wget is available on the remote host",
            )
            .with_hint("Install curl or wget remotely, or upload the archive from the local machine."));
        }
        for pct in parse_progress_percentages(&output.stderr) {
            self.report(pct);
        }
        if !output.success() {
            return Err(RemoteError::command(
                &format!("download {} -> {}", url, remote_path),
                output.exit_code,
                &output.stderr,
            ));
        }
        remote_file_size(session, remote_path).await
    }
}

fn local_artifact(source_kind: ArtifactSource, path: &Path, size: u64) -> ServerArtifact {
    ServerArtifact {
        source_kind,
        location: path.display().to_string(),
        expected_size_bytes: Some(size),
    }
}

fn remote_artifact(source_kind: ArtifactSource, path: String, size: Option<u64>) -> ServerArtifact {
    ServerArtifact {
        source_kind,
        location: path,
        expected_size_bytes: size,
    }
}

/// Size of a remote regular file, or `None` when it is absent.
pub async fn remote_file_size(session: &Session, remote_path: &str) -> Result<Option<u64>, RemoteError> {
    let quoted = escape_shell_value(remote_path);
    let output = session
        .exec(&format!("test -f {} && wc -c < {}", quoted, quoted))
        .await?;
    if !output.success() {
        return Ok(None);
    }
    let raw = output.stdout.trim();
    raw.parse::<u64>().map(Some).map_err(|_| {
        RemoteError::protocol(format!("Unexpected wc output for {}: {}", remote_path, raw))
    })
}

pub fn remote_download_script(url: &str, remote_path: &str) -> String {
    let dest = escape_shell_value(remote_path);
    let tmp = escape_shell_value(&format!("{}.part", remote_path));
    let quoted_url = escape_shell_value(url);
    let mkdir = parent_dir(remote_path)
        .map(|dir| format!("mkdir -p {}\n", escape_shell_value(dir)))
        .unwrap_or_default();
    format!(
        "{mkdir}if command -v curl >/dev/null 2>&1; then\n\
         \tcurl -fL --retry 2 --progress-bar -o {tmp} {url}\n\
         elif command -v wget >/dev/null 2>&1; then\n\
         \twget --progress=dot:giga -O {tmp} {url}\n\
         else\n\
         \techo {marker}\n\
         \texit 3\n\
         fi\n\
         status=$?\n\
         if [ $status -ne 0 ]; then\n\
         \trm -f {tmp}\n\
         \texit $status\n\
         fi\n\
         mv -f {tmp} {dest}\n",
        mkdir = mkdir,
        tmp = tmp,
        url = quoted_url,
        marker = NO_DOWNLOADER_MARKER,
        dest = dest,
    )
}

fn map_reqwest_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::timeout("HTTP request timed out");
    }
    RemoteError::transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(template: &str) -> ArtifactResolver {
        let config = ArtifactConfig {
            dist_dir: None,
            cache_dir: std::env::temp_dir(),
            remote_cache_dir: ".srv/cache".to_string(),
            download_host: "github.com".to_string(),
            download_repo: "acme/server".to_string(),
            artifact_template: template.to_string(),
            mode: ArtifactMode::UploadFromLocal,
        };
        ArtifactResolver::new(Logger::new("test"), config).expect("client")
    }

    #[test]
    fn arch_mapping() {
        assert_eq!(parse_arch("x86_64").expect("x64"), Arch::X64);
        assert_eq!(parse_arch("amd64").expect("x64"), Arch::X64);
        assert_eq!(parse_arch("aarch64\n").expect("arm"), Arch::Arm64);
        assert_eq!(parse_arch("arm64").expect("arm"), Arch::Arm64);
        let err = parse_arch("sparc64").expect_err("unsupported");
        assert_eq!(err.kind, crate::errors::RemoteErrorKind::Unsupported);
        assert!(err.message.contains("sparc64"));
    }

    #[test]
    fn only_linux_is_supported() {
        assert!(parse_os("Linux").is_ok());
        assert!(parse_os("Darwin").is_err());
    }

    #[test]
    fn download_url_renders_template() {
        let server = ServerMetadata::new("1.2.3", "abc");
        let r = resolver(DEFAULT_ARTIFACT_TEMPLATE);
        assert_eq!(
            r.download_url(&server, Arch::Arm64),
            "https://github.com/acme/server/releases/download/v1.2.3/remote-dev-server-reh-linux-arm64-1.2.3.tar.gz"
        );
    }

    #[test]
    fn cache_key_is_stable_and_short() {
        let name = cache_key_file_name("https://example.com/a.tar.gz");
        assert!(name.starts_with("server-"));
        assert!(name.ends_with(".tar.gz"));
        assert_eq!(name.len(), "server-".len() + 16 + ".tar.gz".len());
        assert_eq!(name, cache_key_file_name("https://example.com/a.tar.gz"));
        assert_ne!(name, cache_key_file_name("https://example.com/b.tar.gz"));
    }

    #[test]
    fn remote_cache_path_uses_cache_key() {
        let r = resolver(DEFAULT_ARTIFACT_TEMPLATE);
        let path = r.remote_cache_path("https://example.com/a.tar.gz");
        assert!(path.starts_with(".srv/cache/server-"));
    }

    #[test]
    fn download_script_detects_missing_downloader() {
        let script = remote_download_script("https://x/y.tar.gz", ".srv/cache/server-1.tar.gz");
        assert!(script.starts_with("mkdir -p '.srv/cache'\n"));
        assert!(script.contains("command -v curl"));
        assert!(script.contains("command -v wget"));
        assert!(script.contains(NO_DOWNLOADER_MARKER));
        assert!(script.contains("mv -f '.srv/cache/server-1.tar.gz.part' '.srv/cache/server-1.tar.gz'"));
    }

    #[test]
    fn binary_path_is_relative_to_home() {
        let server = ServerMetadata::new("1.0.0", "deadbeef");
        assert_eq!(
            server.remote_binary_paths(),
            vec![
                ".remote-dev-server/bin/deadbeef/bin/remote-dev-server".to_string(),
                ".remote-dev-server/bin/deadbeef/bin/code-server-oss".to_string(),
                ".remote-dev-server/bin/deadbeef/bin/code-server".to_string(),
            ]
        );
    }
}
