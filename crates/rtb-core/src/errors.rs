/// Core error type.
///
/// Adapter crates map their specific errors into this type so the services
/// can handle failures consistently. `Business` and `NotFound` are expected
/// outcomes that were already logged where they happened; transport
/// boundaries skip them without alerting or retrying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Business(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Expected outcome rather than an infrastructure failure.
    pub fn is_business(&self) -> bool {
        matches!(self, Error::Business(_) | Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_classification() {
        assert!(Error::NotFound("request".into()).is_business());
        assert!(Error::Business("duplicate".into()).is_business());
        assert!(!Error::Storage("disk full".into()).is_business());
        assert!(!Error::Bus("closed".into()).is_business());
    }
}
