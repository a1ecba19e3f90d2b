use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },

    #[error("CHUNK_SIZE must be a power of two, got {0}")]
    InvalidChunkSize(u64),

    #[error("Configuration error: {0}")]
    General(String),
}

/// Closed set of error kinds for the streaming core. HTTP mapping happens
/// once, at the server boundary.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid file reference")]
    InvalidReference,

    #[error("Download link has expired")]
    ReferenceExpired,

    #[error("File not found or has been deleted")]
    ReferenceNotFound,

    #[error("Upstream transient error: {0}")]
    UpstreamTransient(String),

    /// The platform signalled that the file lives in another data-center.
    /// Handled inside the chunk fetcher; never surfaces to a client.
    #[error("Upstream session must re-authenticate against dc {dc_id}")]
    UpstreamAuthMigration { dc_id: i32 },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Requested range not satisfiable for size {size}")]
    RangeNotSatisfiable { size: u64 },

    #[error("Monthly bandwidth ceiling reached")]
    BandwidthCeilingReached,

    #[error("Rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("No client identity available")]
    NoClientAvailable,

    /// The consumer stopped reading. Internal bookkeeping only.
    #[error("Client cancelled the stream")]
    ClientCancelled,

    #[error("Short chunk at offset {offset}: expected {expected} bytes, got {got}")]
    ShortChunk {
        offset: u64,
        expected: usize,
        got: usize,
    },

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Errors worth retrying on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::UpstreamTransient(_) | BridgeError::Transport(_) | BridgeError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
