use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use super::errors::CommandError;
use super::middleware::{BoxedResult, CommandMiddleware, ErasedCommand, Next};
use super::{Command, CommandHandler};

// ============================================================================
// Command Registry - type-keyed handler factories
// ============================================================================
//
// Populated once at startup and then shared behind an Arc. Lookups are keyed
// by TypeId, so there is no name matching on the hot path.
//
// Resolution order:
// 1. handler registered for the exact command type
// 2. open-generic registration, closed over the command type through
//    `Command::close_generic` and cached under the exact type from then on
//
// ============================================================================

pub type HandlerFactory<C> = Arc<dyn Fn() -> Box<dyn CommandHandler<C>> + Send + Sync>;

/// Terminal link of a middleware chain
pub(crate) trait ErasedHandler: Send + Sync {
    fn invoke(&self, command: ErasedCommand, ct: CancellationToken) -> BoxFuture<'static, anyhow::Result<BoxedResult>>;
}

struct TypedHandler<C: Command> {
    factory: HandlerFactory<C>,
}

impl<C: Command> ErasedHandler for TypedHandler<C> {
    fn invoke(&self, command: ErasedCommand, ct: CancellationToken) -> BoxFuture<'static, anyhow::Result<BoxedResult>> {
        let factory = self.factory.clone();

        Box::pin(async move {
            let command = command.into_inner::<C>().map_err(|other| {
                anyhow::anyhow!(
                    "command type mismatch: expected {}, got {}",
                    std::any::type_name::<C>(),
                    other.type_name()
                )
            })?;

            // Fresh handler instance per request
            let handler = factory();
            let result = handler.execute(command, ct).await?;
            Ok(Box::new(result) as BoxedResult)
        })
    }
}

pub(crate) struct HandlerDefinition {
    handler_type: &'static str,
    handler: Arc<dyn ErasedHandler>,
    /// Runs after the global middleware, for this command type only
    middleware: Vec<Arc<dyn CommandMiddleware>>,
    compiled: OnceLock<Next>,
}

impl HandlerDefinition {
    fn new<C: Command>(
        handler_type: &'static str,
        factory: HandlerFactory<C>,
        middleware: Vec<Arc<dyn CommandMiddleware>>,
    ) -> Self {
        Self {
            handler_type,
            handler: Arc::new(TypedHandler { factory }),
            middleware,
            compiled: OnceLock::new(),
        }
    }

    /// Compiled chain for this command type, built on first use
    pub(crate) fn executor(&self, global: &[Arc<dyn CommandMiddleware>]) -> Next {
        self.compiled
            .get_or_init(|| {
                let chain: Vec<Arc<dyn CommandMiddleware>> =
                    global.iter().chain(self.middleware.iter()).cloned().collect();

                tracing::debug!(
                    handler = self.handler_type,
                    middleware_count = chain.len(),
                    "Compiled command executor"
                );
                Next::start(Arc::from(chain), self.handler.clone())
            })
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }
}

/// Open-generic handler registrations, keyed by unbound definition name.
///
/// The stored value is whatever shared state the handler family needs; a
/// generic command picks it up in `Command::close_generic` and builds a
/// handler for its own type arguments.
#[derive(Default)]
pub struct OpenGenericHandlers {
    definitions: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl OpenGenericHandlers {
    pub fn contains(&self, definition: &str) -> bool {
        self.definitions.contains_key(definition)
    }

    pub fn state<S: Any + Send + Sync>(&self, definition: &str) -> Option<Arc<S>> {
        self.definitions.get(definition).cloned()?.downcast::<S>().ok()
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    handlers: DashMap<TypeId, Arc<HandlerDefinition>>,
    open_generics: OpenGenericHandlers,
    middleware: Vec<Arc<dyn CommandMiddleware>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<C, H>(&mut self, factory: impl Fn() -> H + Send + Sync + 'static) -> &mut Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.register_handler_with_middleware::<C, H>(factory, Vec::new())
    }

    /// Same as `register_handler`, with middleware that only wraps this command
    pub fn register_handler_with_middleware<C, H>(
        &mut self,
        factory: impl Fn() -> H + Send + Sync + 'static,
        middleware: Vec<Arc<dyn CommandMiddleware>>,
    ) -> &mut Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let factory: HandlerFactory<C> = Arc::new(move || Box::new(factory()) as Box<dyn CommandHandler<C>>);
        let definition = HandlerDefinition::new::<C>(std::any::type_name::<H>(), factory, middleware);

        if self
            .handlers
            .insert(TypeId::of::<C>(), Arc::new(definition))
            .is_some()
        {
            tracing::warn!(command = C::NAME, "Replaced existing command handler registration");
        }

        self
    }

    /// Middleware runs in the order it was registered. Register all middleware
    /// before the first command executes; compiled chains are not rebuilt.
    pub fn register_middleware(&mut self, middleware: impl CommandMiddleware) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn register_open_generic<S: Any + Send + Sync>(&mut self, definition: &'static str, state: S) -> &mut Self {
        self.open_generics.definitions.insert(definition, Arc::new(state));
        self
    }

    pub fn is_registered<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    pub(crate) fn middleware(&self) -> &[Arc<dyn CommandMiddleware>] {
        &self.middleware
    }

    pub(crate) fn resolve<C: Command>(&self) -> Result<Arc<HandlerDefinition>, CommandError> {
        let key = TypeId::of::<C>();

        if let Some(definition) = self.handlers.get(&key) {
            return Ok(definition.value().clone());
        }

        let factory = C::close_generic(&self.open_generics)
            .ok_or(CommandError::HandlerNotRegistered { command: C::NAME })?;

        let definition = self
            .handlers
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(command = C::NAME, "Closed open-generic command handler");
                Arc::new(HandlerDefinition::new::<C>(std::any::type_name::<C>(), factory, Vec::new()))
            })
            .value()
            .clone();

        Ok(definition)
    }
}
