//! Error types shared by every reactive primitive.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A user-raised failure with a plain message.
    #[error("{0}")]
    Message(String),

    /// A user-raised failure wrapping an arbitrary error value.
    #[error("{0}")]
    Custom(Rc<dyn std::error::Error + 'static>),

    /// Nested notifications exceeded `RuntimeConfig::max_update_depth`.
    #[error("update cascade exceeded {limit} nested notifications while writing `{key}`")]
    CascadeOverflow { key: String, limit: usize },

    #[error("`{key}` is a computed property and cannot be assigned")]
    ReadOnly { key: String },

    #[error("expected a JSON object or array, got {found}")]
    NotAContainer { found: &'static str },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("invalid runtime configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Message(message.to_string())
    }

    #[must_use]
    pub fn custom<E>(error: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::Custom(Rc::new(error))
    }

    /// True for the cancellation signal, which is not a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Overflow is fatal: error boundaries let it through untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CascadeOverflow { .. })
    }
}
