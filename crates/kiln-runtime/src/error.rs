//! Container runtime error types.

use thiserror::Error;

/// Errors returned by a [`ContainerRuntime`](crate::ContainerRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed (exit code: {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("no such {kind}: {reference}")]
    NotFound {
        kind: &'static str,
        reference: String,
    },

    #[error("unexpected output from `{command}`: {message}")]
    Output { command: String, message: String },

    #[error("request rejected by runtime: {0}")]
    Rejected(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
