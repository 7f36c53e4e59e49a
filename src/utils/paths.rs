use crate::utils::user_paths::home_dir;
use std::env;
use std::path::PathBuf;

fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn resolve_xdg_cache_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_CACHE_HOME").ok()) {
        return Some(path);
    }
    home_dir().map(|home| home.join(".cache"))
}

/// Local directory holding downloaded server archives.
pub fn resolve_cache_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("REMOTE_DEV_CACHE_DIR").ok()) {
        return path;
    }
    resolve_xdg_cache_dir()
        .map(|dir| dir.join("remote-dev"))
        .unwrap_or_else(|| env::temp_dir().join("remote-dev-cache"))
}

pub fn resolve_dist_dir() -> Option<PathBuf> {
    normalize_env_path(env::var("REMOTE_DEV_DIST_DIR").ok())
}

pub fn resolve_agent_socket() -> Option<PathBuf> {
    normalize_env_path(env::var("SSH_AUTH_SOCK").ok())
}

/// Remote cache directory, relative to the login directory of the remote user.
pub fn remote_cache_dir(data_folder: &str) -> String {
    format!("{}/cache", data_folder.trim_end_matches('/'))
}
