use thiserror::Error;

/// Application-wide error types.
///
/// Every fallible operation in Larder returns this enum. It uses `thiserror`
/// so library errors convert automatically:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use larder_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::ConfigError("MFR_UID is not set".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// Wraps all errors from SQLx, including connection failures, query
    /// errors and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// HTTP client request failed before a response was received, or the
    /// response body could not be read.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// The partner API answered with a non-success status other than 429.
    ///
    /// Carries the status code and the raw response body.
    #[error("Partner API returned HTTP {status}: {body}")]
    ApiError { status: u16, body: String },

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The partner API answered HTTP 429. Retried with backoff.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Configuration error.
    ///
    /// Missing credentials, unknown environment selector, or an invalid
    /// configuration file. Never retried.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A partner document did not have the expected JSON:API shape.
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// No user is registered for a participation key.
    #[error("No user registered for participation key: {0}")]
    UserNotFound(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("unable to open database") {
                    "Cannot open the SQLite database.\n   Check the --database path and its permissions."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::ClientError(msg) => {
                if msg.contains("timeout") || msg.contains("timed out") {
                    "Request timed out. The partner API may be slow or unreachable.\n   Try again later."
                        .to_string()
                } else if msg.contains("connect") {
                    format!(
                        "Cannot connect to the partner API: {}\n   Check your internet connection and MFR_DATA_ENV.",
                        msg
                    )
                } else {
                    format!("API error: {}", msg)
                }
            }
            AppError::ApiError { status, .. } if *status == 401 || *status == 403 => {
                format!(
                    "The partner API rejected the credentials (HTTP {}).\n   Check MFR_UID, MFR_CLIENT and MFR_ACCESS_TOKEN.",
                    status
                )
            }
            AppError::ApiError { status, body } => {
                format!("Partner API error (HTTP {}): {}", status, body)
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The partner API may be overloaded.",
                    secs
                )
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::ConfigError(msg) => {
                format!(
                    "Configuration error: {}\n   Check your .env file or larder.toml.",
                    msg
                )
            }
            AppError::UserNotFound(key) => {
                format!(
                    "No user is registered for participation key '{}'.\n   Try: larder users add {}",
                    key, key
                )
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is transient and the request may be retried.
    ///
    /// Any non-success answer from the partner API counts as transient; the
    /// harvester's attempt ceiling bounds the cost of retrying a permanent one.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::ApiError { .. }
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded => true,
            AppError::ClientError(msg) => {
                msg.contains("timeout") || msg.contains("timed out") || msg.contains("connect")
            }
            AppError::DatabaseError(_)
            | AppError::SerializationError(_)
            | AppError::InvalidUrl(_)
            | AppError::ConfigError(_)
            | AppError::MalformedDocument(_)
            | AppError::UserNotFound(_)
            | AppError::Generic(_) => false,
        }
    }
}
