mod common;

use common::{exit, ok, target, tmp_dir, CountingCredentials, FakeConnection, FakeTransport};
use remote_dev::constants::artifact::NO_DOWNLOADER_MARKER;
use remote_dev::errors::RemoteErrorKind;
use remote_dev::managers::artifact::{
    cache_key_file_name, detect_platform, dist_file_name, Arch, ArtifactConfig, ArtifactMode,
    ArtifactResolver, ArtifactSource, ServerMetadata,
};
use remote_dev::managers::session::{Session, SessionManager};
use remote_dev::services::logger::Logger;
use remote_dev::transport::ExecOutput;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const ARCHIVE_BYTES: usize = 1000;

fn config(cache_dir: PathBuf) -> ArtifactConfig {
    ArtifactConfig {
        dist_dir: None,
        cache_dir,
        remote_cache_dir: ".remote-dev-server/cache".to_string(),
        download_host: "github.com".to_string(),
        download_repo: "acme/server".to_string(),
        artifact_template: "{app}-reh-linux-{arch}-{version}.tar.gz".to_string(),
        mode: ArtifactMode::UploadFromLocal,
    }
}

fn server() -> ServerMetadata {
    ServerMetadata::new("1.0.0", "c0ffee")
}

fn session_with(connection: FakeConnection) -> (Session, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::new(connection));
    let manager = SessionManager::new(
        Logger::new("test"),
        transport.clone(),
        Arc::new(CountingCredentials::default()),
    );
    (manager.session(&target()), transport)
}

/// Answers `wc -c` size checks with the queued sizes; everything else succeeds silently.
fn sized_remote(sizes: Vec<u64>) -> FakeConnection {
    let queue = Mutex::new(VecDeque::from(sizes));
    FakeConnection::new(move |cmd| {
        if cmd.contains("wc -c") {
            match queue.lock().expect("queue").pop_front() {
                Some(size) => ok(&format!("{}\n", size)),
                None => exit(1, ""),
            }
        } else {
            ok("")
        }
    })
}

async fn write_archive(dir: &PathBuf, name: &str) -> PathBuf {
    tokio::fs::create_dir_all(dir).await.expect("mkdir");
    let path = dir.join(name);
    tokio::fs::write(&path, vec![7u8; ARCHIVE_BYTES])
        .await
        .expect("write archive");
    path
}

#[tokio::test]
async fn verified_upload_matching_size_needs_no_retry() {
    let dir = tmp_dir("artifact-upload-ok");
    let local = write_archive(&dir, "server.tar.gz").await;
    let (session, transport) = session_with(sized_remote(vec![1000]));
    let resolver = ArtifactResolver::new(Logger::new("test"), config(dir.clone())).expect("resolver");

    let size = resolver
        .upload_verified(&session, &local, ".remote-dev-server/cache/server.tar.gz")
        .await
        .expect("upload");
    assert_eq!(size, 1000);
    assert_eq!(transport.connection.upload_count(), 1);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn verified_upload_retries_once_on_mismatch() {
    let dir = tmp_dir("artifact-upload-retry");
    let local = write_archive(&dir, "server.tar.gz").await;
    let (session, transport) = session_with(sized_remote(vec![900, 1000]));
    let resolver = ArtifactResolver::new(Logger::new("test"), config(dir.clone())).expect("resolver");

    let size = resolver
        .upload_verified(&session, &local, ".remote-dev-server/cache/server.tar.gz")
        .await
        .expect("upload after retry");
    assert_eq!(size, 1000);
    assert_eq!(transport.connection.upload_count(), 2);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn verified_upload_reports_integrity_error_after_second_mismatch() {
    let dir = tmp_dir("artifact-upload-bad");
    let local = write_archive(&dir, "server.tar.gz").await;
    let (session, transport) = session_with(sized_remote(vec![900, 900]));
    let resolver = ArtifactResolver::new(Logger::new("test"), config(dir.clone())).expect("resolver");

    let err = resolver
        .upload_verified(&session, &local, ".remote-dev-server/cache/server.tar.gz")
        .await
        .expect_err("integrity");
    assert_eq!(err.kind, RemoteErrorKind::Integrity);
    let details = err.details.expect("details");
    assert_eq!(details["expected_bytes"], 1000);
    assert_eq!(details["observed_bytes"], serde_json::json!([900, 900]));
    assert_eq!(transport.connection.upload_count(), 2);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn unsupported_architecture_is_rejected() {
    let (session, _) = session_with(FakeConnection::new(|cmd| {
        if cmd.starts_with("uname") {
            ok("Linux\nsparc64\n")
        } else {
            ok("")
        }
    }));
    let err = detect_platform(&session).await.expect_err("sparc64");
    assert_eq!(err.kind, RemoteErrorKind::Unsupported);
    assert!(err.message.contains("sparc64"));
}

#[tokio::test]
async fn non_linux_platform_is_rejected() {
    let (session, _) = session_with(FakeConnection::new(|_| ok("Darwin\narm64\n")));
    let err = detect_platform(&session).await.expect_err("darwin");
    assert_eq!(err.code, "UNSUPPORTED_PLATFORM");

    let (session, _) = session_with(FakeConnection::new(|_| ok("Linux\naarch64\n")));
    assert_eq!(detect_platform(&session).await.expect("arm"), Arch::Arm64);
}

#[tokio::test]
async fn dist_directory_wins_over_cache() {
    let dir = tmp_dir("artifact-dist");
    let dist = dir.join("dist");
    let cache = dir.join("cache");
    let mut cfg = config(cache.clone());
    cfg.dist_dir = Some(dist.clone());
    let resolver = ArtifactResolver::new(Logger::new("test"), cfg).expect("resolver");

    let url = resolver.download_url(&server(), Arch::X64);
    write_archive(&cache, &cache_key_file_name(&url)).await;
    let dist_path = write_archive(&dist, &dist_file_name(Arch::X64, "1.0.0")).await;

    let artifact = resolver.resolve_local(&server(), Arch::X64).await.expect("resolve");
    assert_eq!(artifact.source_kind, ArtifactSource::LocalDist);
    assert_eq!(artifact.location, dist_path.display().to_string());
    assert_eq!(artifact.expected_size_bytes, Some(1000));

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn local_cache_hit_skips_network() {
    let dir = tmp_dir("artifact-cache");
    let resolver = ArtifactResolver::new(Logger::new("test"), config(dir.clone())).expect("resolver");
    let url = resolver.download_url(&server(), Arch::Arm64);
    let cached = write_archive(&dir, &cache_key_file_name(&url)).await;

    let artifact = resolver.resolve_local(&server(), Arch::Arm64).await.expect("resolve");
    assert_eq!(artifact.source_kind, ArtifactSource::LocalCache);
    assert_eq!(artifact.location, cached.display().to_string());

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn remote_cache_hit_skips_upload() {
    let dir = tmp_dir("artifact-remote-cache");
    let (session, transport) = session_with(sized_remote(vec![4242]));
    let resolver = ArtifactResolver::new(Logger::new("test"), config(dir.clone())).expect("resolver");

    let artifact = resolver
        .resolve_remote(&session, &server(), Arch::X64)
        .await
        .expect("resolve");
    assert_eq!(artifact.source_kind, ArtifactSource::RemoteCache);
    assert_eq!(artifact.expected_size_bytes, Some(4242));
    assert!(artifact.location.starts_with(".remote-dev-server/cache/server-"));
    assert_eq!(transport.connection.upload_count(), 0);
}

#[tokio::test]
async fn local_cache_is_uploaded_when_remote_cache_misses() {
    let dir = tmp_dir("artifact-upload-cache");
    let resolver = ArtifactResolver::new(Logger::new("test"), config(dir.clone())).expect("resolver");
    let url = resolver.download_url(&server(), Arch::X64);
    write_archive(&dir, &cache_key_file_name(&url)).await;

    // First size check is the remote cache lookup (absent), then the post-upload size check.
    let sizes_seen = Mutex::new(VecDeque::from(vec![None, Some(1000u64)]));
    let (session, transport) = session_with(FakeConnection::new(move |cmd| {
        if cmd.contains("wc -c") {
            match sizes_seen.lock().expect("sizes").pop_front().flatten() {
                Some(size) => ok(&format!("{}\n", size)),
                None => exit(1, ""),
            }
        } else {
            ok("")
        }
    }));

    let artifact = resolver
        .resolve_remote(&session, &server(), Arch::X64)
        .await
        .expect("resolve");
    assert_eq!(artifact.source_kind, ArtifactSource::LocalCache);
    assert_eq!(artifact.location, resolver.remote_cache_path(&url));
    assert_eq!(transport.connection.upload_count(), 1);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn remote_download_without_curl_or_wget_is_unsupported() {
    let dir = tmp_dir("artifact-no-downloader");
    let mut cfg = config(dir.clone());
    cfg.mode = ArtifactMode::DownloadOnRemote;
    let resolver = ArtifactResolver::new(Logger::new("test"), cfg).expect("resolver");
    let (session, _) = session_with(FakeConnection::new(|cmd| {
        if cmd.contains("wc -c") {
            exit(1, "")
        } else if cmd.starts_with("sh -c") {
            ExecOutput {
                stdout: format!("{}\n", NO_DOWNLOADER_MARKER),
                stderr: String::new(),
                exit_code: 3,
            }
        } else {
            ok("")
        }
    }));

    let err = resolver
        .resolve_remote(&session, &server(), Arch::X64)
        .await
        .expect_err("no downloader");
    assert_eq!(err.kind, RemoteErrorKind::Unsupported);
    assert_eq!(err.code, "NO_DOWNLOADER");
}

#[tokio::test]
async fn remote_download_reports_progress_and_size() {
    let dir = tmp_dir("artifact-remote-download");
    let mut cfg = config(dir.clone());
    cfg.mode = ArtifactMode::DownloadOnRemote;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let resolver = ArtifactResolver::new(Logger::new("test"), cfg)
        .expect("resolver")
        .with_progress(Arc::new(move |pct: u8| sink.lock().expect("sink").push(pct)));

    let sizes_seen = Mutex::new(VecDeque::from(vec![None, Some(2048u64)]));
    let (session, _) = session_with(FakeConnection::new(move |cmd| {
        if cmd.contains("wc -c") {
            match sizes_seen.lock().expect("sizes").pop_front().flatten() {
                Some(size) => ok(&format!("{}\n", size)),
                None => exit(1, ""),
            }
        } else if cmd.starts_with("sh -c") {
            let mut out = ok("");
            out.stderr = "\r####  25.0%\r########  50.0%\r################ 100.0%\n".to_string();
            out
        } else {
            ok("")
        }
    }));

    let artifact = resolver
        .resolve_remote(&session, &server(), Arch::X64)
        .await
        .expect("resolve");
    assert_eq!(artifact.source_kind, ArtifactSource::RemoteDownload);
    assert_eq!(artifact.expected_size_bytes, Some(2048));
    assert_eq!(*seen.lock().expect("seen"), vec![25, 50, 100]);
}

/// Serves a 302 for release URLs and the archive body for `/blob/...`.
async fn spawn_http_server(fail_with_404: bool) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let response = if fail_with_404 {
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
                } else if path.contains("/releases/download/") {
                    b"HTTP/1.1 302 Found\r\nLocation: /blob/archive.tar.gz\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
                } else {
                    let mut out = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        ARCHIVE_BYTES
                    )
                    .into_bytes();
                    out.extend(std::iter::repeat(9u8).take(ARCHIVE_BYTES));
                    out
                };
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

#[tokio::test]
async fn download_follows_redirect_into_cache() {
    let dir = tmp_dir("artifact-download");
    let port = spawn_http_server(false).await;
    let mut cfg = config(dir.clone());
    cfg.download_host = format!("http://127.0.0.1:{}", port);
    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = progress.clone();
    let resolver = ArtifactResolver::new(Logger::new("test"), cfg)
        .expect("resolver")
        .with_progress(Arc::new(move |pct: u8| sink.lock().expect("sink").push(pct)));

    let artifact = resolver.resolve_local(&server(), Arch::X64).await.expect("download");
    assert_eq!(artifact.source_kind, ArtifactSource::Download);
    assert_eq!(artifact.expected_size_bytes, Some(ARCHIVE_BYTES as u64));

    let url = resolver.download_url(&server(), Arch::X64);
    let cached = dir.join(cache_key_file_name(&url));
    let meta = tokio::fs::metadata(&cached).await.expect("cached file");
    assert_eq!(meta.len(), ARCHIVE_BYTES as u64);
    assert_eq!(progress.lock().expect("progress").last(), Some(&100));

    let again = resolver.resolve_local(&server(), Arch::X64).await.expect("cached");
    assert_eq!(again.source_kind, ArtifactSource::LocalCache);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn failed_download_leaves_no_partial_file() {
    let dir = tmp_dir("artifact-download-404");
    let port = spawn_http_server(true).await;
    let mut cfg = config(dir.clone());
    cfg.download_host = format!("http://127.0.0.1:{}", port);
    let resolver = ArtifactResolver::new(Logger::new("test"), cfg).expect("resolver");

    let err = resolver
        .resolve_local(&server(), Arch::X64)
        .await
        .expect_err("404");
    assert_eq!(err.kind, RemoteErrorKind::Transport);
    assert_eq!(err.details.expect("details")["status"], 404);

    let mut entries = tokio::fs::read_dir(&dir).await.expect("cache dir");
    assert!(entries.next_entry().await.expect("entry").is_none());

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
