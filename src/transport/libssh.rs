use super::{Connection, ExecOutput, ForwardHandle, Target, Transport, TransportError};
use crate::constants::network as network_constants;
use crate::services::identity::{CredentialSet, Identity};
use crate::services::logger::Logger;
use crate::utils::shell::{escape_shell_value, parent_dir};
use base64::Engine;
use ssh2::{Channel, Session};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const WOULD_BLOCK_DEADLINE_MS: u64 = 60_000;

#[derive(Clone)]
pub struct Ssh2Transport {
    logger: Logger,
    ready_timeout_ms: u64,
    keepalive_interval_ms: u64,
    agent_socket: Option<PathBuf>,
}

impl Ssh2Transport {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("ssh"),
            ready_timeout_ms: network_constants::TIMEOUT_SSH_READY_MS,
            keepalive_interval_ms: network_constants::KEEPALIVE_INTERVAL_MS,
            agent_socket: None,
        }
    }

    pub fn with_ready_timeout_ms(mut self, ready_timeout_ms: u64) -> Self {
        self.ready_timeout_ms = ready_timeout_ms;
        self
    }

    /// Agent socket used for agent-backed authentication instead of `SSH_AUTH_SOCK`.
    pub fn with_agent_socket(mut self, agent_socket: Option<PathBuf>) -> Self {
        self.agent_socket = agent_socket;
        self
    }
}

#[async_trait::async_trait]
impl Transport for Ssh2Transport {
    async fn connect(
        &self,
        target: &Target,
        credentials: &CredentialSet,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let target = target.clone();
        let credentials = credentials.clone();
        let logger = self.logger.clone();
        let ready_timeout_ms = self.ready_timeout_ms;
        let keepalive_interval_ms = self.keepalive_interval_ms;
        let agent_socket = self.agent_socket.clone();
        let session = tokio::task::spawn_blocking(move || {
            connect_session(
                &target,
                &credentials,
                ready_timeout_ms,
                keepalive_interval_ms,
                agent_socket.as_deref(),
                &logger,
            )
        })
        .await
        .map_err(|_| TransportError::Channel("SSH connect task failed".to_string()))??;
        Ok(Arc::new(Ssh2Connection {
            logger: self.logger.clone(),
            session,
        }))
    }
}

struct Ssh2Connection {
    logger: Logger,
    session: Session,
}

#[async_trait::async_trait]
impl Connection for Ssh2Connection {
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || exec_blocking(&session, &command))
            .await
            .map_err(|_| TransportError::Channel("SSH exec task failed".to_string()))?
    }

    async fn forward_port(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardHandle, TransportError> {
        let listener =
            tokio::net::TcpListener::bind((network_constants::TUNNEL_BIND_ADDRESS, local_port))
                .await?;
        let bound_port = listener.local_addr()?.port();
        let stop = Arc::new(AtomicBool::new(false));

        let session = self.session.clone();
        let logger = self.logger.clone();
        let remote_host = remote_host.to_string();
        let stop_flag = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        logger.warn(
                            "Tunnel accept failed",
                            Some(&serde_json::json!({"port": bound_port, "error": err.to_string()})),
                        );
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(err) => {
                        logger.warn("Tunnel socket handoff failed", Some(&serde_json::json!({"error": err.to_string()})));
                        continue;
                    }
                };
                let session = session.clone();
                let logger = logger.clone();
                let remote_host = remote_host.clone();
                let stop = stop_flag.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(err) =
                        pump_forward(&session, stream, peer, &remote_host, remote_port, &stop)
                    {
                        logger.debug(
                            "Tunnel connection closed with error",
                            Some(&serde_json::json!({
                                "remote": format!("{}:{}", remote_host, remote_port),
                                "error": err.to_string(),
                            })),
                        );
                    }
                });
            }
        });

        Ok(ForwardHandle::new(bound_port, task.abort_handle(), stop))
    }

    async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let session = self.session.clone();
        let local_path: PathBuf = local_path.to_path_buf();
        let remote_path = remote_path.to_string();
        tokio::task::spawn_blocking(move || upload_blocking(&session, &local_path, &remote_path))
            .await
            .map_err(|_| TransportError::Channel("SSH upload task failed".to_string()))?
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            retry(|| {
                session.disconnect(
                    Some(ssh2::DisconnectCode::ByApplication),
                    "closed by remote-dev",
                    None,
                )
            })
        })
        .await
        .map_err(|_| TransportError::Channel("SSH disconnect task failed".to_string()))?
    }
}

fn connect_session(
    target: &Target,
    credentials: &CredentialSet,
    ready_timeout_ms: u64,
    keepalive_interval_ms: u64,
    agent_socket: Option<&Path>,
    logger: &Logger,
) -> Result<Session, TransportError> {
    let label = target.to_string();
    let connect_err = |reason: String| TransportError::Connect {
        target: label.clone(),
        reason,
    };
    let addrs = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| connect_err(err.to_string()))?;
    let timeout = Duration::from_millis(ready_timeout_ms);
    let mut last_error = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => last_error = Some(err.to_string()),
        }
    }
    let tcp = tcp.ok_or_else(|| {
        connect_err(last_error.unwrap_or_else(|| "host resolved to no addresses".to_string()))
    })?;

    let handshake_err = |err: ssh2::Error| TransportError::Handshake {
        target: label.clone(),
        reason: err.to_string(),
    };
    let mut session = Session::new().map_err(handshake_err)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(ready_timeout_ms).unwrap_or(u32::MAX));
    session.handshake().map_err(handshake_err)?;

    if let Some(fingerprint) = fingerprint_host_key_sha256(&session) {
        logger.debug(
            "Accepted host key",
            Some(&serde_json::json!({"target": label, "fingerprint": fingerprint})),
        );
    }

    authenticate(&session, target, credentials, agent_socket, logger)?;

    let interval = std::cmp::max(1, (keepalive_interval_ms / 1000) as u32);
    session.set_keepalive(true, interval);
    session.set_timeout(0);
    session.set_blocking(false);
    Ok(session)
}

fn authenticate(
    session: &Session,
    target: &Target,
    credentials: &CredentialSet,
    agent_socket: Option<&Path>,
    logger: &Logger,
) -> Result<(), TransportError> {
    let mut agent = None;
    let mut failures = Vec::new();
    for identity in credentials {
        let mut attempt = Err("no key material".to_string());
        if identity.agent_backed {
            attempt = auth_with_agent(
                session,
                &mut agent,
                agent_socket,
                &target.username,
                identity,
            );
        }
        if attempt.is_err() {
            if let Some(path) = identity.path.as_deref() {
                attempt = session
                    .userauth_pubkey_file(&target.username, None, path, None)
                    .map_err(|err| err.to_string());
            }
        }
        match attempt {
            Ok(()) if session.authenticated() => {
                logger.info(
                    "Authenticated",
                    Some(&serde_json::json!({
                        "target": target.to_string(),
                        "fingerprint": identity.fingerprint,
                        "agent": identity.agent_backed,
                    })),
                );
                return Ok(());
            }
            Ok(()) => failures.push(format!("{}: partial success", identity.fingerprint)),
            Err(reason) => {
                logger.debug(
                    "Identity rejected",
                    Some(&serde_json::json!({"fingerprint": identity.fingerprint, "reason": reason})),
                );
                failures.push(format!("{}: {}", identity.fingerprint, reason));
            }
        }
    }
    Err(TransportError::Authentication {
        user: target.username.clone(),
        reason: if failures.is_empty() {
            "no usable identities".to_string()
        } else {
            failures.join("; ")
        },
    })
}

fn auth_with_agent(
    session: &Session,
    agent: &mut Option<ssh2::Agent>,
    agent_socket: Option<&Path>,
    username: &str,
    identity: &Identity,
) -> Result<(), String> {
    if agent.is_none() {
        let mut connected = open_agent(session, agent_socket)?;
        connected.connect().map_err(|err| err.to_string())?;
        connected.list_identities().map_err(|err| err.to_string())?;
        *agent = Some(connected);
    }
    let agent = agent
        .as_ref()
        .ok_or_else(|| "agent unavailable".to_string())?;
    let key = agent
        .identities()
        .map_err(|err| err.to_string())?
        .into_iter()
        .find(|key| key.blob() == identity.public_blob.as_slice())
        .ok_or_else(|| "key is no longer held by the agent".to_string())?;
    agent
        .userauth(username, &key)
        .map_err(|err| err.to_string())
}

fn open_agent(session: &Session, agent_socket: Option<&Path>) -> Result<ssh2::Agent, String> {
    let mut agent = session.agent().map_err(|err| err.to_string())?;
    if let Some(socket) = agent_socket {
        agent
            .set_identity_path(socket)
            .map_err(|err| err.to_string())?;
    }
    Ok(agent)
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

fn exec_blocking(session: &Session, command: &str) -> Result<ExecOutput, TransportError> {
    let mut channel = retry(|| session.channel_session())?;
    retry(|| channel.exec(command))?;
    let (stdout, stderr) = collect_output(&mut channel)?;
    retry(|| channel.wait_close())?;
    let exit_code = retry(|| channel.exit_status())?;
    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

fn upload_blocking(
    session: &Session,
    local_path: &Path,
    remote_path: &str,
) -> Result<(), TransportError> {
    let mut file = std::fs::File::open(local_path)?;
    let target = escape_shell_value(remote_path);
    let command = match parent_dir(remote_path) {
        Some(dir) => format!("mkdir -p {} && cat > {}", escape_shell_value(dir), target),
        None => format!("cat > {}", target),
    };

    let mut channel = retry(|| session.channel_session())?;
    retry(|| channel.exec(&command))?;
    let mut chunk = vec![0u8; network_constants::FORWARD_BUFFER_BYTES];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        write_all_nonblocking(&mut channel, &chunk[..n])?;
    }
    retry(|| channel.send_eof())?;
    let (_, stderr) = collect_output(&mut channel)?;
    retry(|| channel.wait_close())?;
    let exit_code = retry(|| channel.exit_status())?;
    if exit_code != 0 {
        return Err(TransportError::Channel(format!(
            "upload to {} exited with code {}: {}",
            remote_path,
            exit_code,
            String::from_utf8_lossy(&stderr).trim()
        )));
    }
    Ok(())
}

fn collect_output(channel: &mut Channel) -> Result<(Vec<u8>, Vec<u8>), TransportError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stderr_stream = channel.stderr();
    let mut buf = [0u8; 8192];
    loop {
        let mut progressed = false;
        progressed |= read_available(channel, &mut buf, &mut stdout)?;
        progressed |= read_available(&mut stderr_stream, &mut buf, &mut stderr)?;
        // EOF only ends the loop once both streams are drained.
        if !progressed && channel.eof() {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(network_constants::POLL_INTERVAL_MS));
        }
    }
    Ok((stdout, stderr))
}

fn read_available(
    reader: &mut impl Read,
    buf: &mut [u8],
    out: &mut Vec<u8>,
) -> Result<bool, TransportError> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(TransportError::Channel(format!("SSH read failed: {}", err))),
    }
}

fn write_all_nonblocking(writer: &mut impl Write, data: &[u8]) -> Result<(), TransportError> {
    let mut offset = 0;
    let started = Instant::now();
    while offset < data.len() {
        match writer.write(&data[offset..]) {
            Ok(n) if n > 0 => offset += n,
            Ok(_) => wait_would_block(started)?,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => wait_would_block(started)?,
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    Ok(())
}

fn pump_forward(
    session: &Session,
    mut stream: TcpStream,
    peer: SocketAddr,
    remote_host: &str,
    remote_port: u16,
    stop: &AtomicBool,
) -> Result<(), TransportError> {
    stream.set_nonblocking(true)?;
    let originator = peer.ip().to_string();
    let mut channel = retry(|| {
        session.channel_direct_tcpip(remote_host, remote_port, Some((originator.as_str(), peer.port())))
    })?;

    let mut buf = vec![0u8; network_constants::FORWARD_BUFFER_BYTES];
    let mut local_closed = false;
    while !stop.load(Ordering::SeqCst) {
        let mut progressed = false;
        if !local_closed {
            match stream.read(&mut buf) {
                Ok(0) => {
                    local_closed = true;
                    retry(|| channel.send_eof())?;
                }
                Ok(n) => {
                    write_all_nonblocking(&mut channel, &buf[..n])?;
                    progressed = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        let mut remote_chunk = Vec::new();
        let received = read_available(&mut channel, &mut buf, &mut remote_chunk)?;
        if received {
            write_all_nonblocking(&mut stream, &remote_chunk)?;
            progressed = true;
        }
        if !received && channel.eof() {
            let _ = stream.shutdown(Shutdown::Write);
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(network_constants::POLL_INTERVAL_MS));
        }
    }
    let _ = channel.close();
    Ok(())
}

fn retry<T>(mut op: impl FnMut() -> Result<T, ssh2::Error>) -> Result<T, TransportError> {
    let started = Instant::now();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.code() == ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => {
                wait_would_block(started)?
            }
            Err(err) => return Err(map_ssh_error(err)),
        }
    }
}

fn wait_would_block(started: Instant) -> Result<(), TransportError> {
    if started.elapsed() > Duration::from_millis(WOULD_BLOCK_DEADLINE_MS) {
        return Err(TransportError::Timeout);
    }
    std::thread::sleep(Duration::from_millis(network_constants::POLL_INTERVAL_MS));
    Ok(())
}

fn map_ssh_error(err: ssh2::Error) -> TransportError {
    let io_err: std::io::Error = err.into();
    match io_err.kind() {
        std::io::ErrorKind::TimedOut => TransportError::Timeout,
        _ => TransportError::Channel(io_err.to_string()),
    }
}
