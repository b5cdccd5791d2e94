use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::errors::CommandError;
use super::middleware::ErasedCommand;
use super::registry::CommandRegistry;
use super::Command;

// ============================================================================
// Command Executor - single entry point for in-process command dispatch
// ============================================================================

#[derive(Clone)]
pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
}

impl CommandExecutor {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub async fn execute<C: Command>(&self, command: C, ct: CancellationToken) -> Result<C::Result, CommandError> {
        let definition = self.registry.resolve::<C>()?;

        if ct.is_cancelled() {
            return Err(CommandError::Cancelled { command: C::NAME });
        }

        tracing::debug!(command = C::NAME, "Executing command");

        let chain = definition.executor(self.registry.middleware());
        let output = chain
            .run(ErasedCommand::new(command), ct)
            .await
            .map_err(|e| {
                tracing::warn!(command = C::NAME, error = %e, "Command failed");
                CommandError::Handler(e)
            })?;

        output
            .downcast::<C::Result>()
            .map(|result| *result)
            .map_err(|_| CommandError::ResultTypeMismatch { command: C::NAME })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{BoxedResult, CommandHandler, CommandMiddleware, HandlerFactory, Next, OpenGenericHandlers};
    use async_trait::async_trait;
    use std::marker::PhantomData;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Echo {
        text: String,
    }

    impl Command for Echo {
        type Result = String;
        const NAME: &'static str = "Echo";
    }

    struct EchoHandler {
        trace: Trace,
    }

    #[async_trait]
    impl CommandHandler<Echo> for EchoHandler {
        async fn execute(&self, command: Echo, _ct: CancellationToken) -> anyhow::Result<String> {
            self.trace.lock().unwrap().push("Echo".to_string());
            Ok(command.text)
        }
    }

    struct Tracing {
        name: &'static str,
        trace: Trace,
    }

    #[async_trait]
    impl CommandMiddleware for Tracing {
        async fn execute(&self, command: ErasedCommand, next: Next, ct: CancellationToken) -> anyhow::Result<BoxedResult> {
            self.trace.lock().unwrap().push(format!("{} enter", self.name));
            let result = next.run(command, ct).await;
            self.trace.lock().unwrap().push(format!("{} exit", self.name));
            result
        }
    }

    struct Deny;

    #[async_trait]
    impl CommandMiddleware for Deny {
        async fn execute(&self, command: ErasedCommand, _next: Next, _ct: CancellationToken) -> anyhow::Result<BoxedResult> {
            anyhow::bail!("{} rejected", command.name())
        }
    }

    fn echo_registry(trace: &Trace) -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        let handler_trace = trace.clone();
        registry.register_handler::<Echo, _>(move || EchoHandler {
            trace: handler_trace.clone(),
        });
        registry
    }

    #[tokio::test]
    async fn test_middleware_runs_in_registration_order() {
        let trace: Trace = Arc::default();
        let mut registry = echo_registry(&trace);
        registry
            .register_middleware(Tracing { name: "Logger", trace: trace.clone() })
            .register_middleware(Tracing { name: "Auth", trace: trace.clone() });

        let executor = CommandExecutor::new(Arc::new(registry));
        let result = executor
            .execute(Echo { text: "hi".into() }, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, "hi");
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["Logger enter", "Auth enter", "Echo", "Auth exit", "Logger exit"]
        );
    }

    #[tokio::test]
    async fn test_command_middleware_runs_after_global() {
        let trace: Trace = Arc::default();
        let mut registry = CommandRegistry::new();
        let handler_trace = trace.clone();
        registry
            .register_middleware(Tracing { name: "Logger", trace: trace.clone() })
            .register_handler_with_middleware::<Echo, _>(
                move || EchoHandler { trace: handler_trace.clone() },
                vec![Arc::new(Tracing { name: "Audit", trace: trace.clone() })],
            );

        let executor = CommandExecutor::new(Arc::new(registry));
        executor
            .execute(Echo { text: "hi".into() }, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["Logger enter", "Audit enter", "Echo", "Audit exit", "Logger exit"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let trace: Trace = Arc::default();
        let mut registry = echo_registry(&trace);
        registry.register_middleware(Deny);

        let executor = CommandExecutor::new(Arc::new(registry));
        let err = executor
            .execute(Echo { text: "hi".into() }, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Handler(_)));
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let executor = CommandExecutor::new(Arc::new(CommandRegistry::new()));
        let err = executor
            .execute(Echo { text: "hi".into() }, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::HandlerNotRegistered { command: "Echo" }));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let trace: Trace = Arc::default();
        let executor = CommandExecutor::new(Arc::new(echo_registry(&trace)));
        let ct = CancellationToken::new();
        ct.cancel();

        let err = executor.execute(Echo { text: "hi".into() }, ct).await.unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_created_per_request_and_executor_compiled_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let trace: Trace = Arc::default();
        let mut registry = CommandRegistry::new();
        let (counter, handler_trace) = (created.clone(), trace.clone());
        registry.register_handler::<Echo, _>(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            EchoHandler { trace: handler_trace.clone() }
        });

        let registry = Arc::new(registry);
        let executor = CommandExecutor::new(registry.clone());
        for _ in 0..3 {
            executor
                .execute(Echo { text: "x".into() }, CancellationToken::new())
                .await
                .unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert!(registry.resolve::<Echo>().unwrap().is_compiled());
    }

    // Generic command closed over an open-generic registration

    const LOOKUP_DEFINITION: &str = "Lookup<T>";

    struct Lookup<T> {
        _marker: PhantomData<fn() -> T>,
    }

    impl<T: Default + Send + 'static> Command for Lookup<T> {
        type Result = (String, T);
        const NAME: &'static str = "Lookup";

        fn close_generic(open: &OpenGenericHandlers) -> Option<HandlerFactory<Self>> {
            let prefix = open.state::<String>(LOOKUP_DEFINITION)?;
            Some(Arc::new(move || {
                Box::new(LookupHandler::<T> {
                    prefix: prefix.clone(),
                    _marker: PhantomData,
                }) as Box<dyn CommandHandler<Lookup<T>>>
            }))
        }
    }

    struct LookupHandler<T> {
        prefix: Arc<String>,
        _marker: PhantomData<fn() -> T>,
    }

    #[async_trait]
    impl<T: Default + Send + 'static> CommandHandler<Lookup<T>> for LookupHandler<T> {
        async fn execute(&self, _command: Lookup<T>, _ct: CancellationToken) -> anyhow::Result<(String, T)> {
            Ok((format!("{}:{}", self.prefix, std::any::type_name::<T>()), T::default()))
        }
    }

    #[tokio::test]
    async fn test_open_generic_fallback_is_closed_and_cached() {
        let mut registry = CommandRegistry::new();
        registry.register_open_generic(LOOKUP_DEFINITION, "lookup".to_string());
        let registry = Arc::new(registry);
        let executor = CommandExecutor::new(registry.clone());

        assert!(!registry.is_registered::<Lookup<u32>>());

        let (label, value) = executor
            .execute(Lookup::<u32> { _marker: PhantomData }, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(label, "lookup:u32");
        assert_eq!(value, 0);
        assert!(registry.is_registered::<Lookup<u32>>());
        assert!(!registry.is_registered::<Lookup<bool>>());
    }

    #[tokio::test]
    async fn test_generic_without_registration_is_missing() {
        let executor = CommandExecutor::new(Arc::new(CommandRegistry::new()));
        let err = executor
            .execute(Lookup::<u32> { _marker: PhantomData }, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::HandlerNotRegistered { command: "Lookup" }));
    }
}
