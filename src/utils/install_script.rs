use crate::constants::install::{LISTENING_PREFIX, LOG_POLL_ATTEMPTS, LOG_POLL_INTERVAL};
use crate::errors::RemoteError;
use crate::managers::artifact::ServerMetadata;
use crate::utils::shell::escape_shell_value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;

static ENV_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallField {
    ExitCode,
    ListeningOn,
    ConnectionToken,
    LogFile,
    OsReleaseId,
    Arch,
    Platform,
    TmpDir,
}

impl InstallField {
    pub const ALL: [InstallField; 8] = [
        InstallField::ExitCode,
        InstallField::ListeningOn,
        InstallField::ConnectionToken,
        InstallField::LogFile,
        InstallField::OsReleaseId,
        InstallField::Arch,
        InstallField::Platform,
        InstallField::TmpDir,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            InstallField::ExitCode => "exitCode",
            InstallField::ListeningOn => "listeningOn",
            InstallField::ConnectionToken => "connectionToken",
            InstallField::LogFile => "logFile",
            InstallField::OsReleaseId => "osReleaseId",
            InstallField::Arch => "arch",
            InstallField::Platform => "platform",
            InstallField::TmpDir => "tmpDir",
        }
    }

    /// Shell variable holding the value inside the script.
    fn variable(&self) -> &'static str {
        match self {
            InstallField::ExitCode => "1",
            InstallField::ListeningOn => "LISTENING_ON",
            InstallField::ConnectionToken => "CONNECTION_TOKEN",
            InstallField::LogFile => "SERVER_LOGFILE",
            InstallField::OsReleaseId => "OS_RELEASE_ID",
            InstallField::Arch => "ARCH",
            InstallField::Platform => "PLATFORM",
            InstallField::TmpDir => "TMP_DIR",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|field| field.key() == key)
    }
}

pub fn start_marker(install_id: &str) -> String {
    format!("{}: start", install_id)
}

pub fn end_marker(install_id: &str) -> String {
    format!("{}: end", install_id)
}

pub fn validate_env_var_name(name: &str) -> Result<(), RemoteError> {
    if ENV_KEY_RE.is_match(name) {
        return Ok(());
    }
    Err(RemoteError::invalid_params(format!(
        "Invalid environment variable name: {}",
        name
    )))
}

#[derive(Debug, Clone)]
pub struct InstallScriptParams<'a> {
    pub install_id: &'a str,
    pub server: &'a ServerMetadata,
    /// Remote archive path relative to home; `None` when the server is already extracted.
    pub archive_path: Option<&'a str>,
    pub connection_token: &'a str,
    pub extensions: &'a [String],
    pub env_vars: &'a [String],
    pub use_socket: bool,
}

/// The script always exits 0 and reports through a block framed by
/// `<installId>: start` / `<installId>: end`, one `key==value==` line per
/// [`InstallField`] followed by the requested environment variables.
pub fn build_install_script(params: &InstallScriptParams<'_>) -> Result<String, RemoteError> {
    for name in params.env_vars {
        validate_env_var_name(name)?;
    }
    if params.install_id.trim().is_empty() || params.install_id.contains(['\n', '\r']) {
        return Err(RemoteError::invalid_params("install id must be a single non-empty line"));
    }

    let server = params.server;
    let q = escape_shell_value;
    let mut s = String::new();

    let _ = writeln!(s, "SERVER_APP_NAME={}", q(&server.app_name));
    let _ = writeln!(s, "SERVER_COMMIT={}", q(&server.commit));
    let _ = writeln!(s, "SERVER_VERSION={}", q(&server.version));
    let _ = writeln!(s, "SERVER_QUALITY={}", q(&server.quality));
    let _ = writeln!(
        s,
        "SERVER_DATA_DIR=\"$HOME\"/{}",
        q(server.data_folder.trim_end_matches('/'))
    );
    s.push_str("SERVER_DIR=\"$SERVER_DATA_DIR/bin/$SERVER_COMMIT\"\n");
    s.push_str("SERVER_SCRIPT=\"$SERVER_DIR/bin/$SERVER_APP_NAME\"\n");
    s.push_str("SERVER_LOGFILE=\"$SERVER_DATA_DIR/.$SERVER_COMMIT.log\"\n");
    s.push_str("SERVER_PIDFILE=\"$SERVER_DATA_DIR/.$SERVER_COMMIT.pid\"\n");
    s.push_str("SERVER_TOKENFILE=\"$SERVER_DATA_DIR/.$SERVER_COMMIT.token\"\n");
    match params.archive_path {
        Some(path) => {
            let _ = writeln!(s, "SERVER_ARCHIVE=\"$HOME\"/{}", q(path));
        }
        None => s.push_str("SERVER_ARCHIVE=\n"),
    }
    s.push_str("TMP_DIR=\"${TMPDIR:-/tmp}\"\n");
    s.push_str("LISTENING_ON=\nCONNECTION_TOKEN=\nOS_RELEASE_ID=\nARCH=\nPLATFORM=\n");
    if params.use_socket {
        let _ = writeln!(
            s,
            "LISTEN_FLAG=\"--socket-path=$TMP_DIR/remote-dev-server-$SERVER_COMMIT-{}.sock\"",
            params.install_id
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect::<String>()
        );
    } else {
        s.push_str("LISTEN_FLAG=\"--port=0\"\n");
    }
    s.push('\n');

    // Result block.
    s.push_str("print_install_results_and_exit() {\n");
    let _ = writeln!(s, "\techo {}", q(&start_marker(params.install_id)));
    for field in InstallField::ALL {
        let _ = writeln!(s, "\techo \"{}==${{{}:-}}==\"", field.key(), field.variable());
    }
    for name in params.env_vars {
        let _ = writeln!(s, "\techo \"{}==${{{}:-}}==\"", name, name);
    }
    let _ = writeln!(s, "\techo {}", q(&end_marker(params.install_id)));
    s.push_str("\texit 0\n}\n\n");

    s.push_str(
        "KERNEL=\"$(uname -s)\"\n\
         case $KERNEL in\n\
         \tLinux) PLATFORM=linux ;;\n\
         \t*) echo \"Error platform not supported: $KERNEL\"; print_install_results_and_exit 1 ;;\n\
         esac\n\
         ARCH=\"$(uname -m)\"\n\
         case $ARCH in\n\
         \tx86_64 | amd64) ARCH=x64 ;;\n\
         \taarch64 | arm64) ARCH=arm64 ;;\n\
         \t*) echo \"Error architecture not supported: $ARCH\"; print_install_results_and_exit 1 ;;\n\
         esac\n\
         if [ -f /etc/os-release ]; then\n\
         \tOS_RELEASE_ID=\"$(grep -i '^ID=' /etc/os-release | sed 's/^ID=//gi' | sed 's/\"//g')\"\n\
         elif [ -f /usr/lib/os-release ]; then\n\
         \tOS_RELEASE_ID=\"$(grep -i '^ID=' /usr/lib/os-release | sed 's/^ID=//gi' | sed 's/\"//g')\"\n\
         else\n\
         \tOS_RELEASE_ID=unknown\n\
         fi\n\n\
         if ! mkdir -p \"$SERVER_DATA_DIR\"; then\n\
         \techo \"Error creating server data directory\"\n\
         \tprint_install_results_and_exit 1\n\
         fi\n\n",
    );

    // Primary binary name first, then the fallbacks.
    s.push_str("resolve_server_script() {\n");
    let mut names = vec![q(&server.app_name)];
    names.extend(server.fallback_binaries.iter().map(|name| q(name)));
    let _ = writeln!(s, "\tfor name in {}; do", names.join(" "));
    s.push_str(
        "\t\tif [ -f \"$SERVER_DIR/bin/$name\" ]; then\n\
         \t\t\tSERVER_SCRIPT=\"$SERVER_DIR/bin/$name\"\n\
         \t\t\treturn 0\n\
         \t\tfi\n\
         \tdone\n\
         \treturn 1\n\
         }\n\n",
    );

    s.push_str(
        "if ! resolve_server_script; then\n\
         \tif [ -z \"$SERVER_ARCHIVE\" ] || [ ! -f \"$SERVER_ARCHIVE\" ]; then\n\
         \t\techo \"Error server archive not found: $SERVER_ARCHIVE\"\n\
         \t\tprint_install_results_and_exit 1\n\
         \tfi\n\
         \tmkdir -p \"$SERVER_DIR\"\n\
         \tif ! tar -xf \"$SERVER_ARCHIVE\" -C \"$SERVER_DIR\" --strip-components 1; then\n\
         \t\techo \"Error while extracting server contents\"\n\
         \t\tprint_install_results_and_exit 1\n\
         \tfi\n\
         \tif ! resolve_server_script; then\n\
         \t\techo \"Error server binary not found after extraction\"\n\
         \t\tprint_install_results_and_exit 1\n\
         \tfi\n",
    );
    if !params.extensions.is_empty() {
        let flags: Vec<String> = params
            .extensions
            .iter()
            .map(|id| format!("--install-extension {}", q(id)))
            .collect();
        let _ = writeln!(s, "\t\"$SERVER_SCRIPT\" {} --force", flags.join(" "));
    }
    s.push_str("fi\n\n");

    s.push_str(
        "SERVER_RUNNING_PROCESS=\n\
         if [ -f \"$SERVER_PIDFILE\" ]; then\n\
         \tSERVER_PID=\"$(cat \"$SERVER_PIDFILE\")\"\n\
         \tif [ -n \"$SERVER_PID\" ]; then\n\
         \t\tSERVER_RUNNING_PROCESS=\"$(ps -o pid,args -p \"$SERVER_PID\" | grep \"$SERVER_SCRIPT\" | grep -v grep)\"\n\
         \tfi\n\
         else\n\
         \tSERVER_RUNNING_PROCESS=\"$(ps -o pid,args -A | grep \"$SERVER_SCRIPT\" | grep -v grep)\"\n\
         fi\n\n\
         if [ -z \"$SERVER_RUNNING_PROCESS\" ]; then\n\
         \trm -f \"$SERVER_LOGFILE\" \"$SERVER_TOKENFILE\"\n\
         \ttouch \"$SERVER_TOKENFILE\"\n\
         \tchmod 600 \"$SERVER_TOKENFILE\"\n",
    );
    let _ = writeln!(s, "\tCONNECTION_TOKEN={}", q(params.connection_token));
    s.push_str(
        "\tprintf '%s' \"$CONNECTION_TOKEN\" > \"$SERVER_TOKENFILE\"\n\
         \tnohup \"$SERVER_SCRIPT\" --start-server --host=127.0.0.1 $LISTEN_FLAG --connection-token-file \"$SERVER_TOKENFILE\" --telemetry-level off --enable-remote-auto-shutdown --accept-server-license-terms > \"$SERVER_LOGFILE\" 2>&1 &\n\
         \techo $! > \"$SERVER_PIDFILE\"\n\
         else\n\
         \tCONNECTION_TOKEN=\"$(cat \"$SERVER_TOKENFILE\")\"\n\
         fi\n\n",
    );

    let attempts: Vec<String> = (1..=LOG_POLL_ATTEMPTS).map(|n| n.to_string()).collect();
    let _ = writeln!(s, "for _ in {}; do", attempts.join(" "));
    let _ = writeln!(
        s,
        "\tLISTENING_ON=\"$(grep -E '{prefix}.+' \"$SERVER_LOGFILE\" 2>/dev/null | sed 's/{prefix}//' | head -n 1)\"",
        prefix = LISTENING_PREFIX
    );
    s.push_str("\tif [ -n \"$LISTENING_ON\" ]; then\n\t\tbreak\n\tfi\n");
    let _ = writeln!(s, "\tsleep {}", LOG_POLL_INTERVAL);
    s.push_str(
        "done\n\n\
         if [ -z \"$LISTENING_ON\" ]; then\n\
         \tcat \"$SERVER_LOGFILE\" 2>/dev/null\n\
         \techo \"Error server did not start successfully\"\n\
         \tprint_install_results_and_exit 1\n\
         fi\n\n\
         print_install_results_and_exit 0\n",
    );

    Ok(s)
}
