// ============================================================================
// Command Pipeline Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("No handler registered for command: {command}")]
    HandlerNotRegistered { command: &'static str },

    #[error("Command was cancelled before dispatch: {command}")]
    Cancelled { command: &'static str },

    #[error("Handler for {command} returned an unexpected result type")]
    ResultTypeMismatch { command: &'static str },

    #[error("Command handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}
