use crate::errors::RemoteError;
use crate::utils::install_script::{end_marker, start_marker, InstallField};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ListeningOn {
    Port(u16),
    Socket(String),
}

impl ListeningOn {
    fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(match raw.parse::<u16>() {
            Ok(port) => ListeningOn::Port(port),
            Err(_) => ListeningOn::Socket(raw.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallResult {
    pub exit_code: i32,
    pub listening_on: Option<ListeningOn>,
    pub connection_token: Option<String>,
    pub log_file: Option<String>,
    pub os_release_id: Option<String>,
    pub arch: Option<String>,
    pub platform: Option<String>,
    pub tmp_dir: Option<String>,
    pub extra_env: BTreeMap<String, String>,
}

fn unparsable(reason: &str) -> RemoteError {
    RemoteError::protocol(format!("Could not parse install output: {}", reason))
}

/// `key==value==` with the value possibly empty.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let body = line.trim().strip_suffix("==")?;
    let (key, value) = body.split_once("==")?;
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value))
}

/// Extracts the result block of the last run of `install_id` from mixed stdout.
pub fn parse_install_output(
    stdout: &str,
    install_id: &str,
    env_vars: &[String],
) -> Result<InstallResult, RemoteError> {
    let start = start_marker(install_id);
    let end = end_marker(install_id);
    let lines: Vec<&str> = stdout.lines().collect();

    let start_idx = lines
        .iter()
        .rposition(|line| line.trim() == start)
        .ok_or_else(|| unparsable("start marker not found"))?;
    let end_idx = lines[start_idx + 1..]
        .iter()
        .position(|line| line.trim() == end)
        .map(|offset| start_idx + 1 + offset)
        .ok_or_else(|| unparsable("end marker not found"))?;

    let mut exit_code: Option<i32> = None;
    let mut result = InstallResult {
        exit_code: 0,
        listening_on: None,
        connection_token: None,
        log_file: None,
        os_release_id: None,
        arch: None,
        platform: None,
        tmp_dir: None,
        extra_env: BTreeMap::new(),
    };

    for line in &lines[start_idx + 1..end_idx] {
        let Some((key, value)) = split_field(line) else {
            continue;
        };
        let text = || (!value.is_empty()).then(|| value.to_string());
        match InstallField::from_key(key) {
            Some(InstallField::ExitCode) => {
                let code = value
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| unparsable(&format!("invalid exitCode {:?}", value)))?;
                exit_code = Some(code);
            }
            Some(InstallField::ListeningOn) => result.listening_on = ListeningOn::parse(value.trim()),
            Some(InstallField::ConnectionToken) => result.connection_token = text(),
            Some(InstallField::LogFile) => result.log_file = text(),
            Some(InstallField::OsReleaseId) => result.os_release_id = text(),
            Some(InstallField::Arch) => result.arch = text(),
            Some(InstallField::Platform) => result.platform = text(),
            Some(InstallField::TmpDir) => result.tmp_dir = text(),
            None => {
                if env_vars.iter().any(|name| name == key) {
                    result.extra_env.insert(key.to_string(), value.to_string());
                }
            }
        }
    }

    result.exit_code = exit_code.ok_or_else(|| unparsable("exitCode missing"))?;
    Ok(result)
}
