//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::Config("bad level".to_string()).to_string(),
            "Configuration error: bad level"
        );
        assert_eq!(
            Error::Other("subscriber".to_string()).to_string(),
            "Other error: subscriber"
        );
    }
}
