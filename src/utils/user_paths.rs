use std::path::{Path, PathBuf};

pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .filter(|home| !home.trim().is_empty())
        .map(PathBuf::from)
}

pub fn expand_home_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Some(str_path) = path.to_str() {
        if let Some(rest) = str_path.strip_prefix("~/") {
            if let Some(home) = home_dir() {
                return home.join(rest);
            }
        }
        if str_path == "~" {
            if let Some(home) = home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Identity files may be given as the public half; the private key sits next to it.
pub fn strip_pub_suffix(raw: &str) -> &str {
    raw.strip_suffix(".pub").unwrap_or(raw)
}

pub fn default_ssh_dir() -> PathBuf {
    home_dir()
        .map(|home| home.join(".ssh"))
        .unwrap_or_else(|| PathBuf::from(".ssh"))
}
