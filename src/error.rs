use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to analyse `{}`: {reason}", path.display())]
    Discovery { path: PathBuf, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("could not load module at `{}`: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("lesson `{0}` has no usable get_agent() entry point")]
    MissingEntryPoint(String),

    #[error("{message}. {hint}")]
    Configuration { message: String, hint: String },

    #[error("{message}")]
    Execution {
        message: String,
        traceback: Option<String>,
    },

    #[error("execution timed out after {0}s")]
    Timeout(u64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    pub fn configuration(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            traceback: None,
        }
    }

    /// Full diagnostic text for an error event: the runner-supplied traceback when
    /// there is one, otherwise the chain of underlying causes.
    pub fn traceback(&self) -> String {
        if let Self::Execution {
            traceback: Some(tb),
            ..
        } = self
        {
            return tb.clone();
        }
        let mut rendered = format!("{self:?}");
        let mut source = self.source();
        while let Some(cause) = source {
            rendered.push_str("\ncaused by: ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }
}
