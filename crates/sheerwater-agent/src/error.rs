//! Error types for sheerwater-agent

use thiserror::Error;

/// Result type alias using sheerwater-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the transcript and settings stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Conversation not found: {0}")]
    NotFound(String),

    /// Appending would break timestamp order
    #[error("Out-of-order append to {conversation_id}: {timestamp} is older than {last}")]
    OutOfOrder {
        conversation_id: String,
        timestamp: i64,
        last: i64,
    },
}

/// Fatal errors for a turn.
///
/// Tool failures are not here: they are recorded on the tool call and fed back
/// to the model. An exhausted step bound is a partial success, not an error.
#[derive(Error, Debug)]
pub enum Error {
    /// The model provider could not produce a response for this step
    #[error("Model unavailable at step {step}: {source}")]
    ModelUnavailable {
        step: u32,
        #[source]
        source: sheerwater_ai::Error,
    },

    /// The transcript could not be durably updated
    #[error("Transcript store failure: {0}")]
    Store(#[from] StoreError),

    /// The conversation does not exist or belongs to another user
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// The turn task panicked or was torn down
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// A single explanatory message to show in place of an assistant reply
    pub fn user_message(&self) -> String {
        match self {
            Error::ModelUnavailable { source, .. } => match source {
                sheerwater_ai::Error::RateLimited { .. } => {
                    "The assistant is receiving too many requests right now. Please wait a moment and try again.".to_string()
                }
                sheerwater_ai::Error::Auth(_) | sheerwater_ai::Error::InvalidApiKey => {
                    "The assistant is not configured correctly (provider authentication failed).".to_string()
                }
                _ => "The assistant is temporarily unavailable. Please try again.".to_string(),
            },
            Error::Store(_) => {
                "Your conversation could not be saved. Please try again.".to_string()
            }
            Error::ConversationNotFound(_) => "Conversation not found.".to_string(),
            Error::Internal(_) => "Something went wrong while processing your message.".to_string(),
        }
    }
}
