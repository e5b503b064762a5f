use thiserror::Error;

/// Result alias for everything touching the cloud service.
pub type CloudResult<T> = Result<T, CloudError>;

/// Error taxonomy for the bridge.
///
/// `Auth` is fatal for the account until the user fixes credentials,
/// `Api` is transient and handled via the coordinator's backoff,
/// `NotFound` means the remote positively reported a meter gone,
/// `Config` is only ever raised at setup time.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Bad credentials or a repeated auth rejection after one refresh attempt.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Transient network or server failure (timeout, connection reset, 5xx).
    #[error("cloud API error: {0}")]
    Api(String),

    /// The remote service no longer knows this meter.
    #[error("meter {0} not found on the cloud service")]
    NotFound(String),

    /// Malformed account or bridge setup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CloudError {
    /// True for failures that should only ever surface at setup time.
    pub fn is_config(&self) -> bool {
        matches!(self, CloudError::Config(_))
    }

    /// True when the account needs the user to re-enter credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }

    /// True for failures worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Api(_))
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CloudError::Api(format!("request timed out: {err}"))
        } else {
            CloudError::Api(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Api(format!("invalid response body: {err}"))
    }
}
