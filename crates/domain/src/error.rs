/// Shared error type used across all jarvis crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    /// Tool backend unreachable, timed out, or otherwise failed to respond.
    /// Never retried inside the Hub; surfaced in the tool result.
    #[error("transport: {0}")]
    Transport(String),

    /// Missing/invalid tool arguments or malformed JSON from a model.
    /// Retryable at most twice with parameter-alias fixes.
    #[error("validation: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A safety check or CIM policy match denied the request outright.
    /// Surfaced as a deterministic refusal; Output is never called.
    #[error("policy blocked: {0}")]
    PolicyBlock(String),

    /// A model call exceeded its configured timeout budget.
    #[error("model timeout: {0}")]
    ModelTimeout(String),

    /// A model call returned a non-2xx HTTP status or transport failure.
    #[error("model http error: {0}")]
    ModelHttp(String),

    /// The loop engine hit `MAX_LOOP_ITERATIONS` or detected a stuck tool
    /// with no remaining alternative.
    #[error("loop engine: {0}")]
    StuckOrMaxIterations(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
