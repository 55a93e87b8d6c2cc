//! Error types for Fanout

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FanoutError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FanoutError::InvalidInput(_) => 3,
            FanoutError::Publish(PublishError::Auth(_)) => 2,
            FanoutError::Publish(_) => 1,
            FanoutError::Config(_) => 1,
            FanoutError::Database(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Structured failure from a target Publisher.
///
/// The dispatcher is the only place these are classified into retry
/// behavior; publishers just report what the target said.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Target rejected request ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Seconds until the limit resets, from a retry-after style header.
        retry_after_secs: Option<u64>,
        /// Absolute epoch-second reset time, from a rate-limit-reset field.
        reset_at: Option<i64>,
    },

    #[error("Network error: {0}")]
    Network(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = FanoutError::InvalidInput("empty text".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_auth_error() {
        let error = FanoutError::Publish(PublishError::Auth("bad token".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_publish_errors() {
        let network = FanoutError::Publish(PublishError::Network("timeout".to_string()));
        assert_eq!(network.exit_code(), 1);

        let http = FanoutError::Publish(PublishError::Http {
            status: 400,
            message: "bad request".to_string(),
        });
        assert_eq!(http.exit_code(), 1);

        let rate = FanoutError::Publish(PublishError::RateLimited {
            message: "slow down".to_string(),
            retry_after_secs: Some(30),
            reset_at: None,
        });
        assert_eq!(rate.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_config_and_db() {
        let config = FanoutError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(config.exit_code(), 1);

        let db = FanoutError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        )));
        assert_eq!(db.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting() {
        let error = FanoutError::Publish(PublishError::Http {
            status: 422,
            message: "text too long".to_string(),
        });
        assert_eq!(
            format!("{}", error),
            "Publish error: Target rejected request (422): text too long"
        );
    }

    #[test]
    fn test_publish_error_clone() {
        // Clone is required so a scripted mock can replay errors
        let original = PublishError::Network("connection reset".to_string());
        let cloned = original.clone();
        assert_eq!(format!("{}", original), format!("{}", cloned));
    }

    #[test]
    fn test_error_conversions() {
        let config_error: FanoutError = ConfigError::MissingField("x".to_string()).into();
        assert!(matches!(config_error, FanoutError::Config(_)));

        let db_error: FanoutError =
            DbError::Corrupt("bad remote_ids json".to_string()).into();
        assert!(matches!(db_error, FanoutError::Database(_)));

        let publish_error: FanoutError = PublishError::Network("x".to_string()).into();
        assert!(matches!(publish_error, FanoutError::Publish(_)));
    }
}
