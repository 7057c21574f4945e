pub mod client;
pub mod protocol;

/// Default server address used by the CLI when none is configured.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";
