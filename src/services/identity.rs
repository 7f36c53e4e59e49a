use crate::constants::identity as identity_constants;
use crate::errors::RemoteError;
use crate::services::logger::Logger;
use crate::transport::Target;
use crate::utils::user_paths::{default_ssh_dir, expand_home_path, strip_pub_suffix};
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    File,
    Agent,
}

#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub source: IdentitySource,
    pub path: Option<PathBuf>,
    #[serde(skip)]
    pub public_blob: Vec<u8>,
    pub comment: String,
    pub algorithm: String,
    pub fingerprint: String,
    pub is_certificate: bool,
    pub agent_backed: bool,
}

impl Identity {
    pub fn from_agent_key(key: &AgentKey) -> Option<Self> {
        let algorithm = blob_algorithm(&key.blob)?;
        Some(Self {
            source: IdentitySource::Agent,
            path: None,
            is_certificate: algorithm.ends_with(identity_constants::CERT_TYPE_MARKER),
            fingerprint: fingerprint_sha256(&key.blob),
            public_blob: key.blob.clone(),
            comment: key.comment.clone(),
            algorithm,
            agent_backed: true,
        })
    }

    fn match_key(&self) -> (&str, &str) {
        (self.algorithm.as_str(), self.fingerprint.as_str())
    }
}

/// Ordered credentials for one authentication attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialSet(Vec<Identity>);

impl CredentialSet {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self(identities)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Identity> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.0.iter().map(|id| id.fingerprint.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a CredentialSet {
    type Item = &'a Identity;
    type IntoIter = std::slice::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityRequest {
    pub identity_files: Vec<String>,
    pub agent_socket: Option<PathBuf>,
    pub identities_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentKey {
    pub blob: Vec<u8>,
    pub comment: String,
}

/// Supplies a fresh credential set whenever a session needs to authenticate.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, target: &Target) -> Result<CredentialSet, RemoteError>;
}

#[derive(Clone)]
pub struct IdentityResolver {
    logger: Logger,
    ssh_dir: PathBuf,
    request: IdentityRequest,
    agent_timeout_ms: u64,
}

impl IdentityResolver {
    pub fn new(logger: Logger, request: IdentityRequest) -> Self {
        Self {
            logger: logger.child("identity"),
            ssh_dir: default_ssh_dir(),
            request,
            agent_timeout_ms: identity_constants::AGENT_TIMEOUT_MS,
        }
    }

    pub fn with_ssh_dir(mut self, ssh_dir: impl Into<PathBuf>) -> Self {
        self.ssh_dir = ssh_dir.into();
        self
    }

    pub fn with_agent_timeout_ms(mut self, agent_timeout_ms: u64) -> Self {
        self.agent_timeout_ms = agent_timeout_ms;
        self
    }

    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        if self.request.identity_files.is_empty() {
            return identity_constants::DEFAULT_KEY_FILES
                .iter()
                .map(|name| self.ssh_dir.join(name))
                .collect();
        }
        self.request
            .identity_files
            .iter()
            .map(|raw| expand_home_path(strip_pub_suffix(raw.trim())))
            .collect()
    }

    pub async fn resolve(&self) -> CredentialSet {
        let mut file_identities = Vec::new();
        for path in self.candidate_paths() {
            file_identities.extend(self.load_file_identities(&path).await);
        }

        let agent_identities = match self.request.agent_socket.as_deref() {
            Some(socket) => match query_agent(socket, self.agent_timeout_ms).await {
                Ok(keys) => keys.iter().filter_map(Identity::from_agent_key).collect(),
                Err(err) => {
                    self.logger.warn(
                        "SSH agent unavailable, using key files only",
                        Some(&serde_json::json!({
                            "socket": socket.display().to_string(),
                            "error": err.message,
                        })),
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let credentials = merge_identities(
            file_identities,
            agent_identities,
            self.request.identities_only,
        );
        self.logger.debug(
            "Resolved credentials",
            Some(&serde_json::json!({
                "count": credentials.len(),
                "fingerprints": credentials.fingerprints(),
            })),
        );
        credentials
    }

    async fn load_file_identities(&self, path: &Path) -> Vec<Identity> {
        let mut out = Vec::new();
        match tokio::fs::read_to_string(path).await {
            Ok(text) => match identity_from_private_key(&text, path) {
                Ok(identity) => out.push(identity),
                Err(err) => self.logger.debug(
                    "Skipping unparsable key file",
                    Some(&serde_json::json!({"path": path.display().to_string(), "error": err.message})),
                ),
            },
            Err(err) => {
                self.logger.debug(
                    "Skipping unreadable key file",
                    Some(&serde_json::json!({"path": path.display().to_string(), "error": err.to_string()})),
                );
                return out;
            }
        }

        let cert_path = PathBuf::from(format!(
            "{}{}",
            path.display(),
            identity_constants::CERT_SUFFIX
        ));
        if let Ok(text) = tokio::fs::read_to_string(&cert_path).await {
            if let Some(cert) = identity_from_certificate(&text, path) {
                out.push(cert);
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl CredentialProvider for IdentityResolver {
    async fn credentials(&self, _target: &Target) -> Result<CredentialSet, RemoteError> {
        Ok(self.resolve().await)
    }
}

/// `SHA256:<unpadded base64>` over the public key wire encoding, as printed by `ssh-keygen -l`.
pub fn fingerprint_sha256(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", encoded)
}

/// Key type name stored as the leading string of a public key blob.
pub fn blob_algorithm(blob: &[u8]) -> Option<String> {
    let mut buf = blob;
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if len == 0 || buf.remaining() < len {
        return None;
    }
    std::str::from_utf8(&buf[..len]).ok().map(|s| s.to_string())
}

pub fn identity_from_private_key(text: &str, path: &Path) -> Result<Identity, RemoteError> {
    let key = ssh_key::PrivateKey::from_openssh(text.trim())
        .map_err(|err| RemoteError::credential(format!("Invalid private key: {}", err)))?;
    let public = key.public_key();
    let blob = public
        .to_bytes()
        .map_err(|err| RemoteError::credential(format!("Invalid public key: {}", err)))?;
    let algorithm =
        blob_algorithm(&blob).unwrap_or_else(|| public.algorithm().as_str().to_string());
    Ok(Identity {
        source: IdentitySource::File,
        path: Some(path.to_path_buf()),
        fingerprint: fingerprint_sha256(&blob),
        public_blob: blob,
        comment: key.comment().to_string(),
        algorithm,
        is_certificate: false,
        agent_backed: false,
    })
}

pub fn identity_from_certificate(text: &str, key_path: &Path) -> Option<Identity> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))?;
    let mut tokens = line.split_whitespace();
    let algorithm = tokens.next()?;
    if !algorithm.ends_with(identity_constants::CERT_TYPE_MARKER) {
        return None;
    }
    let blob = base64::engine::general_purpose::STANDARD
        .decode(tokens.next()?.as_bytes())
        .ok()?;
    Some(Identity {
        source: IdentitySource::File,
        path: Some(key_path.to_path_buf()),
        fingerprint: fingerprint_sha256(&blob),
        public_blob: blob,
        comment: tokens.collect::<Vec<_>>().join(" "),
        algorithm: algorithm.to_string(),
        is_certificate: true,
        agent_backed: false,
    })
}

/// Ranks agent keys that also exist on disk first, then agent-only keys, then
/// the remaining file keys. Certificates never match and are dropped at the end.
pub fn merge_identities(
    file_identities: Vec<Identity>,
    agent_identities: Vec<Identity>,
    identities_only: bool,
) -> CredentialSet {
    let mut file_pool = dedupe(file_identities);
    let mut matched = Vec::new();
    let mut agent_only = Vec::new();

    for agent in dedupe(agent_identities) {
        let position = file_pool
            .iter()
            .position(|file| !file.is_certificate && file.match_key() == agent.match_key());
        match position {
            Some(index) => {
                let mut merged = file_pool.remove(index);
                merged.agent_backed = true;
                if merged.comment.is_empty() {
                    merged.comment = agent.comment;
                }
                matched.push(merged);
            }
            None if !identities_only => agent_only.push(agent),
            None => {}
        }
    }

    let ordered = matched
        .into_iter()
        .chain(agent_only)
        .chain(file_pool)
        .filter(|identity| !identity.is_certificate)
        .collect();
    CredentialSet::new(ordered)
}

fn dedupe(identities: Vec<Identity>) -> Vec<Identity> {
    let mut seen = HashSet::new();
    identities
        .into_iter()
        .filter(|id| {
            seen.insert((
                id.algorithm.clone(),
                id.fingerprint.clone(),
                id.is_certificate,
            ))
        })
        .collect()
}

/// Lists the agent's identities. The whole exchange is bounded by `timeout_ms`.
pub async fn query_agent(socket: &Path, timeout_ms: u64) -> Result<Vec<AgentKey>, RemoteError> {
    tokio::time::timeout(
        std::time::Duration::from_millis(timeout_ms),
        request_identities(socket),
    )
    .await
    .map_err(|_| {
        RemoteError::credential(format!(
            "SSH agent at {} did not answer within {}ms",
            socket.display(),
            timeout_ms
        ))
        .with_details(serde_json::json!({"timeout_ms": timeout_ms}))
    })?
}

async fn request_identities(socket: &Path) -> Result<Vec<AgentKey>, RemoteError> {
    let unreachable = |err: std::io::Error| {
        RemoteError::credential(format!(
            "SSH agent at {} is unreachable: {}",
            socket.display(),
            err
        ))
    };
    let mut stream = tokio::net::UnixStream::connect(socket)
        .await
        .map_err(unreachable)?;

    let mut request = BytesMut::with_capacity(5);
    request.put_u32(1);
    request.put_u8(SSH_AGENTC_REQUEST_IDENTITIES);
    stream.write_all(&request).await.map_err(unreachable)?;

    let len = stream.read_u32().await.map_err(unreachable)? as usize;
    if len == 0 || len > identity_constants::MAX_AGENT_REPLY_BYTES {
        return Err(RemoteError::credential(format!(
            "SSH agent reply has invalid length {}",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(unreachable)?;
    parse_identities_answer(&payload)
}

pub fn parse_identities_answer(payload: &[u8]) -> Result<Vec<AgentKey>, RemoteError> {
    let malformed = || RemoteError::credential("Malformed SSH agent identities answer");
    let mut buf = payload;
    if !buf.has_remaining() || buf.get_u8() != SSH_AGENT_IDENTITIES_ANSWER {
        return Err(malformed());
    }
    if buf.remaining() < 4 {
        return Err(malformed());
    }
    let count = buf.get_u32();
    let mut keys = Vec::new();
    for _ in 0..count {
        let blob = read_string(&mut buf).ok_or_else(malformed)?;
        let comment = read_string(&mut buf).ok_or_else(malformed)?;
        keys.push(AgentKey {
            blob,
            comment: String::from_utf8_lossy(&comment).into_owned(),
        });
    }
    Ok(keys)
}

fn read_string(buf: &mut &[u8]) -> Option<Vec<u8>> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len).to_vec())
}
