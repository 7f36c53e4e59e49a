mod remote_error;

pub use remote_error::{RemoteError, RemoteErrorKind};
