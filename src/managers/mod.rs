pub mod artifact;
pub mod provision;
pub mod session;
