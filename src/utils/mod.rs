pub mod fs_atomic;
pub mod install_output;
pub mod install_script;
pub mod paths;
pub mod progress;
pub mod shell;
pub mod user_paths;
