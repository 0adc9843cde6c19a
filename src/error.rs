use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;
pub type ConfigError = Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("{last} (after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Transient upstream failures: worth retrying, counted by the breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout(_) | Error::RateLimited(_) | Error::Io(_) => true,
            Error::RetriesExhausted { last, .. } => last.is_transient(),
            _ => false,
        }
    }

    /// Caller mistakes: never retried, never a breaker failure.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::Decode(_)
                | Error::InvalidUrl(_)
                | Error::Config(_)
                | Error::Serialization(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen(_))
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Http(_) => "HTTP_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Decode(_) => "DECODE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::Config(_) => "CONFIG",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::Cache(_) => "CACHE",
            Error::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Map an upstream HTTP status into the error taxonomy.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            404 => Error::NotFound(context.to_string()),
            429 => Error::RateLimited(context.to_string()),
            408 => Error::Timeout(context.to_string()),
            s if s >= 500 => Error::Http(format!("HTTP {} for {}", s, context)),
            s if s >= 400 => Error::InvalidRequest(format!("HTTP {} for {}", s, context)),
            s => Error::Http(format!("unexpected HTTP {} for {}", s, context)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Http("500".into()).is_transient());
        assert!(Error::Timeout("deadline".into()).is_transient());
        assert!(Error::RateLimited("429".into()).is_transient());
        assert!(!Error::InvalidRequest("bad filter".into()).is_transient());
        assert!(!Error::NotFound("row".into()).is_transient());
        assert!(!Error::CircuitOpen("stations".into()).is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(Error::InvalidRequest("bad".into()).is_permanent());
        assert!(Error::Decode("trailing garbage".into()).is_permanent());
        assert!(!Error::Http("502".into()).is_permanent());
        assert!(!Error::NotFound("row".into()).is_permanent());
    }

    #[test]
    fn test_status_mapping() {
        assert!(Error::from_status(404, "x").is_not_found());
        assert!(Error::from_status(429, "x").is_transient());
        assert!(Error::from_status(500, "x").is_transient());
        assert!(Error::from_status(503, "x").is_transient());
        assert!(Error::from_status(400, "x").is_permanent());
        assert!(Error::from_status(422, "x").is_permanent());
    }

    #[test]
    fn test_exhausted_wrapper_delegates_classification() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            last: Box::new(Error::Http("HTTP 502".into())),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
