use thiserror::Error;

/// Errors that can occur while driving the chat UI
#[derive(Error, Debug)]
pub enum AutomationError {
    /// A required affordance never resolved through any fallback strategy.
    /// Fatal to the enclosing operation.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// A recipient was typed but never confirmed by a visible token.
    /// Fatal to chat creation.
    #[error("Recipient addition failed: {0}")]
    AdditionFailed(String),

    /// An attachment never reached the ready state. Recoverable per the
    /// configured failure policy.
    #[error("Attachment upload failed: {0}")]
    UploadFailed(String),

    /// Browser launch or navigation failure. Fatal to the run.
    #[error("Session error: {0}")]
    SessionError(String),

    /// A fault raised by the underlying page backend.
    #[error("Driver error: {0}")]
    DriverError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}
