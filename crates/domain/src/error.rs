/// Shared error type used across all threadmind crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("upstream host {host} is not on allowed list")]
    HostNotAllowed { host: String },

    #[error("tool {name}: {message}")]
    Tool { name: String, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("template: {0}")]
    Template(String),

    #[error("host platform: {0}")]
    Host(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("max tool resolution depth exceeded")]
    DepthExceeded,

    #[error("stream inactive")]
    StreamInactive,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors the end user caused or may act on, as opposed to upstream or
    /// internal failures that only belong in logs.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Error::Permission(_) | Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
