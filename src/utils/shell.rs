pub fn escape_shell_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Wraps a multi-line script so it runs under `sh` regardless of the login shell.
pub fn sh_command(script: &str) -> String {
    format!("sh -c {}", escape_shell_value(script))
}

pub fn parent_dir(remote_path: &str) -> Option<&str> {
    let trimmed = remote_path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return Some("/");
    }
    Some(&trimmed[..idx])
}
