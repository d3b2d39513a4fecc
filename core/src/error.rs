use std::path::PathBuf;
use thiserror::Error;

/// Everything a client operation can fail with. Nothing here is retried by
/// the library; callers decide.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Caller input rejected before any network call.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The server answered with well-formed data that breaks an invariant the
    /// client relies on (missing `status`, missing `job_id`, ...).
    #[error("{operation} ({target}): protocol violation: {detail}")]
    Protocol {
        operation: &'static str,
        target: String,
        detail: String,
    },

    /// Non-2xx response, connection failure, or a 2xx body carrying errors.
    #[error("{operation} ({target}) failed{}: {detail}", status_note(.status))]
    RequestFailed {
        operation: &'static str,
        target: String,
        status: Option<u16>,
        detail: String,
    },

    #[error(
        "{operation} ({target}): no analyzers can be run after filtering; \
         check the requested analyzers against the observable type, TLP \
         and plugin availability ({detail})"
    )]
    NoRunnableAnalyzers {
        operation: &'static str,
        target: String,
        detail: String,
    },

    #[error("{} does not exist", .path.display())]
    NotFound { path: PathBuf },

    #[error("invalid client configuration: {0}")]
    Config(String),
}

fn status_note(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" with HTTP {code}"),
        None => String::new(),
    }
}

impl ClientError {
    /// True for the request-failure family, including the specialised
    /// "nothing can run" rejection.
    pub fn is_request_failure(&self) -> bool {
        matches!(self, ClientError::RequestFailed { .. } | ClientError::NoRunnableAnalyzers { .. })
    }

    /// HTTP status attached to the failure, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::RequestFailed { status, .. } => *status,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
