use thiserror::Error;

use fastly::http::request::SendError;

/// Describes an error encountered during ESI document processing.
#[derive(Error, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum ExecutionError {
    /// A `test` expression could not be lexed, parsed or evaluated.
    #[error("failed to evaluate expression: {0}")]
    ExpressionError(String),

    /// A regular expression in a `=~` comparison did not compile.
    #[error("invalid regular expression: {0}")]
    RegexError(#[from] regex::Error),

    /// An include `src` or `alt` did not resolve to a usable URL.
    #[error("invalid request URL provided: `{0}`")]
    InvalidRequestUrl(String),

    /// The fragment request could not be sent or completed.
    #[error("error sending request: {0}")]
    RequestError(#[from] SendError),

    /// A fragment request came back with a non-success status.
    #[error("received unexpected status code for fragment `{0}`: {1}")]
    UnexpectedStatus(String, u16),

    /// Writing to the output stream failed.
    #[error("failed to write output: {0}")]
    WriterError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
