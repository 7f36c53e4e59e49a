pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_READY_MS: u64 = 10_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
    pub const POLL_INTERVAL_MS: u64 = 10;
    pub const FORWARD_BUFFER_BYTES: usize = 64 * 1024;
    pub const TUNNEL_BIND_ADDRESS: &str = "127.0.0.1";
}

pub mod identity {
    /// Conventional key names tried when no identity file is configured, in priority order.
    pub const DEFAULT_KEY_FILES: &[&str] = &[
        "id_rsa",
        "id_ecdsa",
        "id_ecdsa_sk",
        "id_ed25519",
        "id_ed25519_sk",
        "id_xmss",
        "id_dsa",
    ];
    pub const CERT_SUFFIX: &str = "-cert.pub";
    pub const CERT_TYPE_MARKER: &str = "-cert-v01@openssh.com";
    pub const MAX_AGENT_REPLY_BYTES: usize = 256 * 1024;
    pub const AGENT_TIMEOUT_MS: u64 = 3_000;
}

pub mod artifact {
    pub const CACHE_KEY_HEX_LEN: usize = 16;
    pub const MAX_REDIRECTS: usize = 10;
    pub const MAX_TRANSFER_ATTEMPTS: usize = 2;
    pub const DEFAULT_DOWNLOAD_HOST: &str = "github.com";
    pub const DEFAULT_ARTIFACT_TEMPLATE: &str = "{app}-reh-linux-{arch}-{version}.tar.gz";
    pub const NO_DOWNLOADER_MARKER: &str = "__REMOTE_DEV_NO_DOWNLOADER__";
}

pub mod install {
    pub const LOG_POLL_ATTEMPTS: u32 = 5;
    pub const LOG_POLL_INTERVAL: &str = "0.5";
    pub const LISTENING_PREFIX: &str = "Extension host agent listening on ";
    pub const DEFAULT_DATA_FOLDER: &str = ".remote-dev-server";
    pub const DEFAULT_APP_NAME: &str = "remote-dev-server";
    pub const DEFAULT_FALLBACK_BINARIES: &[&str] = &["code-server-oss", "code-server"];
}
