/// Errors from the notification subsystem.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// An HTTP request to the chat platform failed.
    #[error("Notify: HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The chat platform returned a non-success response.
    #[error("Notify: API error: status={status}, body={body}")]
    ApiError { status: u16, body: String },

    /// JSON (de)serialization failed.
    #[error("Notify: JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Generic notification error for cases not covered above.
    #[error("Notify: {0}")]
    Other(String),
}
