use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;
pub type ConfigError = Error;

/// Transport-level failures reported by an [`HttpClient`](crate::http::HttpClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("the internet connection appears to be offline")]
    InternetDown,

    #[error("DNS lookup failed")]
    Dns,

    #[error("could not connect to the server")]
    ServerNotFound,

    #[error("HTTP {0}")]
    Http(u16),

    #[error("request was cancelled")]
    Cancelled,

    #[error("request timed out")]
    TimedOut,

    #[error("server returned a bad response")]
    BadResponse,

    #[error("unknown network error")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    #[error("database not found")]
    NotFound,

    #[error("entry not found")]
    EntryNotFound,

    #[error("unknown database error")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("Network error for {url}: {kind}")]
    Network { url: String, kind: NetworkError },

    #[error("HTTP error: {0}")]
    Http(u16),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Feed parsing error: {0}")]
    FeedParse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Operation not supported by this service")]
    NotSupported,

    #[error("Index {index} out of range (only {count} items available)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Database(match err.kind() {
            std::io::ErrorKind::NotFound => DatabaseError::NotFound,
            _ => DatabaseError::Unknown,
        })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_default();

        let kind = if err.is_timeout() {
            NetworkError::TimedOut
        } else if err.is_connect() {
            NetworkError::ServerNotFound
        } else if let Some(status) = err.status() {
            NetworkError::Http(status.as_u16())
        } else if err.is_decode() || err.is_body() {
            NetworkError::BadResponse
        } else {
            NetworkError::Unknown
        };

        Error::Network { url, kind }
    }
}

impl Error {
    /// Combine a local and a network failure into one error.
    pub fn multiple(local: Error, network: Error) -> Self {
        Error::Multiple(vec![local, network])
    }

    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Network { kind, .. } => !matches!(kind, NetworkError::BadResponse),
            Error::Http(status) => *status >= 500 || *status == 429,
            Error::Multiple(errors) => errors.iter().all(Error::is_temporary),
            _ => false,
        }
    }

    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl(_) | Error::Config(_) | Error::NotSupported
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Network { .. } => "NETWORK",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE",
            Error::FeedParse(_) => "FEED_PARSE",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Config(_) => "CONFIG",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Invalid(_) => "INVALID",
            Error::NotSupported => "NOT_SUPPORTED",
            Error::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            Error::Multiple(_) => "MULTIPLE",
            Error::Unknown(_) => "UNKNOWN",
        }
    }
}
