//! Error handling for flowbridge
//!
//! This module defines the error type shared by the rendezvous channel, the
//! stage adapters and the pipeline composer, plus a Result alias.

use thiserror::Error;

/// Error type produced by stage functions once erased.
///
/// Anything convertible into it (including `anyhow::Error` and every
/// `std::error::Error + Send + Sync`) can be returned from a fallible stage.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for flowbridge operations
#[derive(Error, Debug)]
pub enum FlowError {
    /// A stage function returned an error while being advanced
    #[error("Stage '{stage}' failed: {source}")]
    Transform {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// A stage function panicked while being advanced
    #[error("Stage '{stage}' panicked: {message}")]
    Panicked { stage: String, message: String },

    /// An element was submitted after the end marker
    #[error("Write after end of stream")]
    WriteAfterEnd,

    /// A second pull sequence was requested while one is still live
    #[error("Channel already has a live subscriber")]
    AlreadySubscribed,

    /// The consumer side went away before taking the element
    #[error("Channel closed by its consumer")]
    Closed,

    /// The pipeline was torn down because a sibling stage failed
    #[error("Pipeline aborted: {0}")]
    Aborted(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors (thread spawning, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FlowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Wrap a stage function's error, tagging it with the stage name
    pub fn transform(stage: impl Into<String>, err: impl Into<BoxError>) -> Self {
        FlowError::Transform {
            stage: stage.into(),
            source: err.into(),
        }
    }

    /// Build a `Panicked` error from a caught panic payload
    pub fn from_panic(stage: impl Into<String>, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        FlowError::Panicked {
            stage: stage.into(),
            message,
        }
    }

    /// True for the quiet "downstream stopped accepting" outcome.
    ///
    /// Looks through context wrappers.
    pub fn is_closed(&self) -> bool {
        match self {
            FlowError::Closed => true,
            FlowError::WithContext { source, .. } => source.is_closed(),
            _ => false,
        }
    }
}

/// Result type alias for flowbridge operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
