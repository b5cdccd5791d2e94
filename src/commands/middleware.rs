use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::registry::ErasedHandler;
use super::Command;

// ============================================================================
// Command Middleware - interceptors around every handler invocation
// ============================================================================
//
// Middleware runs in registration order and each one decides whether to call
// `next.run(...)`. The last link of the chain is the handler itself.
//
//   Logger enter -> Auth enter -> Handler -> Auth exit -> Logger exit
//
// Contract: a middleware calls `next.run` at most once. Not calling it ends
// the request early; the pipeline does not detect that.
//
// Middleware is not generic over the command type, so one instance serves
// every command. It sees the command type-erased and may downcast it.
//
// ============================================================================

pub type BoxedResult = Box<dyn Any + Send>;

/// A command on its way through the middleware chain
pub struct ErasedCommand {
    name: &'static str,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl ErasedCommand {
    pub fn new<C: Command>(command: C) -> Self {
        Self {
            name: C::NAME,
            type_name: std::any::type_name::<C>(),
            value: Box::new(command),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<C: Command>(&self) -> Option<&C> {
        self.value.downcast_ref::<C>()
    }

    pub fn downcast_mut<C: Command>(&mut self) -> Option<&mut C> {
        self.value.downcast_mut::<C>()
    }

    pub(crate) fn into_inner<C: Command>(self) -> Result<C, Self> {
        let Self { name, type_name, value } = self;
        value
            .downcast::<C>()
            .map(|boxed| *boxed)
            .map_err(|value| Self { name, type_name, value })
    }
}

impl std::fmt::Debug for ErasedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedCommand")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[async_trait]
pub trait CommandMiddleware: Send + Sync + 'static {
    async fn execute(
        &self,
        command: ErasedCommand,
        next: Next,
        ct: CancellationToken,
    ) -> anyhow::Result<BoxedResult>;
}

/// Remainder of the chain after the current middleware
#[derive(Clone)]
pub struct Next {
    middleware: Arc<[Arc<dyn CommandMiddleware>]>,
    position: usize,
    handler: Arc<dyn ErasedHandler>,
}

impl Next {
    pub(crate) fn start(middleware: Arc<[Arc<dyn CommandMiddleware>]>, handler: Arc<dyn ErasedHandler>) -> Self {
        Self {
            middleware,
            position: 0,
            handler,
        }
    }

    pub fn run(self, command: ErasedCommand, ct: CancellationToken) -> BoxFuture<'static, anyhow::Result<BoxedResult>> {
        Box::pin(async move {
            match self.middleware.get(self.position).cloned() {
                Some(current) => {
                    let next = Next {
                        position: self.position + 1,
                        ..self
                    };
                    current.execute(command, next, ct).await
                }
                None => self.handler.invoke(command, ct).await,
            }
        })
    }
}
