use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Commands - in-process command execution pipeline
// ============================================================================
//
// Command -> CommandExecutor -> registry lookup -> middleware chain -> handler
//
// Handlers are registered up front as factories keyed by command type. The
// middleware chain for a command type is compiled on first use and cached.
//
// ============================================================================

mod errors;
mod executor;
mod middleware;
mod registry;

pub use errors::CommandError;
pub use executor::CommandExecutor;
pub use middleware::{BoxedResult, CommandMiddleware, ErasedCommand, Next};
pub use registry::{CommandRegistry, HandlerFactory, OpenGenericHandlers};

/// A request dispatched to exactly one handler.
///
/// Commands with nothing to return use `type Result = ();`.
pub trait Command: Send + 'static {
    type Result: Send + 'static;

    /// Stable name used for logging and as the remote method name
    const NAME: &'static str;

    /// Generic commands override this to close an open-generic handler
    /// registration over their concrete type arguments. Consulted only when
    /// no handler is registered for the exact command type.
    fn close_generic(_open: &OpenGenericHandlers) -> Option<HandlerFactory<Self>>
    where
        Self: Sized,
    {
        None
    }
}

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn execute(&self, command: C, ct: CancellationToken) -> anyhow::Result<C::Result>;
}
