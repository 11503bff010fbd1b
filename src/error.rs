use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ScreenerError>;

/// Message shown for every rejected login, whatever the reason.
pub const INVALID_CREDENTIALS: &str = "Invalid email or password. Please try again.";

/// Why a sheet could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchCause {
    /// The spreadsheet (or the local file) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The service account has no access to the spreadsheet
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The fetch did not complete within the configured bound
    #[error("timed out after {0}s")]
    Timeout(u64),

    /// Unexpected HTTP status from the remote service
    #[error("HTTP {0}: {1}")]
    Http(u16, String),

    /// The response or file could not be turned into a table
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// Errors surfaced by the screener core.
///
/// A wrong password or a search with no matches are *not* errors; see
/// [`crate::login::LoginOutcome`] and [`crate::search::SearchStatus`].
#[derive(Debug, Error)]
pub enum ScreenerError {
    /// Credential list or spreadsheet credentials missing/malformed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Identifier/secret combination rejected
    #[error("{}", INVALID_CREDENTIALS)]
    AuthenticationFailure,

    /// The table source could not deliver a table
    #[error("source unavailable ({source_name}): {cause}")]
    SourceUnavailable {
        source_name: String,
        #[source]
        cause: FetchCause,
    },

    /// A gated operation was invoked without logging in
    #[error("not signed in")]
    Unauthenticated,

    /// The table view was requested before any fetch succeeded
    #[error("sheet data has not been loaded yet")]
    TableNotLoaded,

    /// Another fetch for the same session is still outstanding
    #[error("sheet data is already loading")]
    FetchInProgress,
}

impl ScreenerError {
    pub fn source_unavailable(source_name: impl Into<String>, cause: FetchCause) -> Self {
        ScreenerError::SourceUnavailable {
            source_name: source_name.into(),
            cause,
        }
    }

    /// True for errors the user can recover from by retrying or reloading.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScreenerError::AuthenticationFailure
                | ScreenerError::SourceUnavailable { .. }
                | ScreenerError::FetchInProgress
                | ScreenerError::TableNotLoaded
        )
    }
}
