use thiserror::Error;

use crate::storage::StorageError;

/// Result type for age gate operations.
pub type AgeGateResult<T, E = AgeGateError> = std::result::Result<T, E>;

/// Error outputs from the age gate.
#[derive(Debug, Error)]
pub enum AgeGateError {
    /// A dependency (geo database, cache) could not be reached. Callers fail open.
    #[error("transient_dependency_error: {0}")]
    TransientDependency(String),
    /// The record store rejected a read or write.
    #[error("persistence_error: {0}")]
    Persistence(String),
    /// Provider data was malformed, expired or forged.
    #[error("validation_error: {message}")]
    Validation {
        /// Human-readable reason, safe to show to the visitor.
        message: String,
        /// Where the visitor can retry the verification, if anywhere.
        retry_url: Option<String>,
    },
    /// A single-use provider assertion was presented a second time.
    #[error("replay_error: assertion already consumed")]
    Replay {
        /// Where the visitor can start a fresh verification.
        retry_url: String,
        /// The visitor already holds a verified cookie token.
        already_verified: bool,
    },
    /// The deployment is missing or has malformed configuration.
    #[error("configuration_error: {0}")]
    Configuration(String),
    /// A fresh age token could not be generated.
    #[error("token_generation_error: {0}")]
    TokenGeneration(String),
}

impl AgeGateError {
    pub(crate) fn validation(message: impl Into<String>, retry_url: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            retry_url: retry_url.map(ToString::to_string),
        }
    }

    /// Returns `true` for errors the visitor can act on (retry or continue).
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::Replay { .. })
    }

    /// Message to render for the visitor. Internal failures get a generic text.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { message, retry_url } => match retry_url {
                Some(url) => format!("{message} Please retry: {url}"),
                None => message.clone(),
            },
            Self::Replay {
                retry_url,
                already_verified,
            } => {
                let mut message = format!(
                    "You may have already used this verification, please return to {retry_url}."
                );
                if *already_verified {
                    message.push_str(
                        " Note: you are already age verified and may continue to the website.",
                    );
                }
                message
            }
            Self::Configuration(_) => {
                "Age verification is not available right now.".to_string()
            }
            Self::TransientDependency(_)
            | Self::Persistence(_)
            | Self::TokenGeneration(_) => {
                "Something went wrong, please try again later.".to_string()
            }
        }
    }
}

impl From<StorageError> for AgeGateError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Cache(message) => Self::TransientDependency(message),
            StorageError::Database(message) | StorageError::Serialization(message) => {
                Self::Persistence(message)
            }
        }
    }
}
