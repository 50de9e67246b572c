//! The API dispatcher (§4.4): resolves a procedure call end to end.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{CallContext, Connection};
use crate::error::RuntimeError;
use crate::format::FormatSelector;
use crate::registry::{Next, Registry};

/// `dispatch(connection, procedureName, rawPayload, timeoutOverride?)` from
/// §4.4, steps 1-10.
pub struct ApiDispatcher {
    registry: Arc<Registry>,
    formats: FormatSelector,
    default_timeout: Duration,
}

impl ApiDispatcher {
    pub fn new(registry: Arc<Registry>, formats: FormatSelector, default_timeout: Duration) -> Self {
        ApiDispatcher { registry, formats, default_timeout }
    }

    pub async fn dispatch(
        &self,
        connection: &Connection,
        procedure_name: &str,
        raw_payload: &[u8],
        timeout_override: Option<Duration>,
    ) -> Vec<u8> {
        let format = match self.formats.select(connection.content_type()) {
            Some(f) => f,
            None => {
                return self.encode_error(
                    connection,
                    &RuntimeError::InvalidPayload(format!("no format supports {}", connection.content_type())),
                )
            }
        };

        let outcome = self.dispatch_inner(connection, procedure_name, raw_payload, timeout_override, &*format).await;
        match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                if !e.is_surfaced() {
                    tracing::error!(procedure = procedure_name, error = %e, "unsurfaced dispatch error");
                } else {
                    tracing::warn!(procedure = procedure_name, error = %e, "dispatch failed");
                }
                self.encode_error(connection, &e)
            }
        }
    }

    fn encode_error(&self, connection: &Connection, err: &RuntimeError) -> Vec<u8> {
        let wire = err.to_wire();
        let value = serde_json::to_value(&wire).unwrap_or(serde_json::Value::Null);
        self.formats
            .select(connection.content_type())
            .and_then(|f| f.encode(&value).ok())
            .unwrap_or_else(|| value.to_string().into_bytes())
    }

    async fn dispatch_inner(
        &self,
        connection: &Connection,
        procedure_name: &str,
        raw_payload: &[u8],
        timeout_override: Option<Duration>,
        format: &dyn crate::format::Format,
    ) -> Result<Vec<u8>, RuntimeError> {
        // 1. Resolve Procedure from registry.
        let procedure = self
            .registry
            .procedure(procedure_name)
            .ok_or_else(|| RuntimeError::NotFound(procedure_name.to_string()))?;

        // 2. Decode payload with the connection's format.
        let input = format
            .decode(raw_payload)
            .map_err(|e| RuntimeError::InvalidPayload(e.to_string()))?;

        // 3. Validate input against the procedure's schema.
        if let Err(fields) = procedure.input_schema.validate(&input) {
            return Err(RuntimeError::ValidationError(fields));
        }

        // 4. Create a Call-scope container as a child of the connection scope.
        let call = Arc::new(CallContext::new(connection.id(), procedure_name, connection.container()));

        let outcome = self.run_guarded(&procedure, call.clone(), input, timeout_override).await;

        // 10. Dispose the Call scope on every exit path.
        call.dispose().await;

        let output = outcome?;

        // 8. Validate output against the output schema; encode.
        if let Err(fields) = procedure.output_schema.validate(&output) {
            return Err(RuntimeError::ValidationError(fields));
        }
        format.encode(&output).map_err(|e| RuntimeError::internal(e))
    }

    async fn run_guarded(
        &self,
        procedure: &crate::registry::Procedure,
        call: Arc<CallContext>,
        input: serde_json::Value,
        timeout_override: Option<Duration>,
    ) -> Result<serde_json::Value, RuntimeError> {
        // 5. Guards in registration order; first falsy result is Forbidden.
        for guard in &procedure.guards {
            let allowed = guard(call.clone()).await?;
            if !allowed {
                return Err(RuntimeError::Forbidden(procedure.name.clone()));
            }
        }

        // 6. Timeout = min(procedure.timeout, api.timeout, timeoutOverride).
        let timeout = [Some(self.default_timeout), procedure.timeout, timeout_override]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.default_timeout);

        // 7. Apply middlewares as nested handlers, outermost first.
        let chain = self.build_chain(procedure);

        let cancellation = call.cancellation().clone();
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(RuntimeError::Timeout),
            result = tokio::time::timeout(timeout, chain(call.clone(), input)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => {
                        call.cancel();
                        Err(RuntimeError::Timeout)
                    }
                }
            }
        }
    }

    fn build_chain(&self, procedure: &crate::registry::Procedure) -> Next {
        let handler = procedure.handler.clone();
        let mut chain: Next = handler;
        for middleware in procedure.middlewares.iter().rev() {
            let inner = chain.clone();
            let mw = middleware.clone();
            chain = Arc::new(move |ctx, input| {
                let inner = inner.clone();
                mw(ctx, input, inner)
            });
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::container::Container;
    use crate::registry::{ModuleBuilder, ProcedureBuilder};
    use crate::schema::ObjectSchema;
    use crate::wire::{ConnectionSink, Frame, SendError};
    use std::sync::Arc;

    struct NullSink;
    impl ConnectionSink for NullSink {
        fn try_send(&self, _frame: Frame) -> Result<(), SendError> {
            Ok(())
        }
    }

    struct JsonFormat;
    impl crate::format::Format for JsonFormat {
        fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, crate::format::FormatError> {
            Ok(value.to_string().into_bytes())
        }
        fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, crate::format::FormatError> {
            serde_json::from_slice(bytes).map_err(|e| crate::format::FormatError(e.to_string()))
        }
        fn supports(&self, content_type: &str) -> bool {
            content_type == "application/json"
        }
        fn content_type(&self) -> &str {
            "application/json"
        }
    }

    fn setup(registry: Registry, timeout: Duration) -> (ApiDispatcher, Connection) {
        registry.load().unwrap();
        let mut formats = FormatSelector::new();
        formats.register(Arc::new(JsonFormat));
        let dispatcher = ApiDispatcher::new(Arc::new(registry), formats, timeout);
        let connection = Connection::new("application/json", Arc::new(NullSink), &Container::root());
        (dispatcher, connection)
    }

    #[tokio::test]
    async fn successful_dispatch_echoes_input() {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("echo")
                .procedure(
                    ProcedureBuilder::new("call", Arc::new(|_ctx, input| Box::pin(async move { Ok(input) })))
                        .build(),
                )
                .build(),
        );
        let (dispatcher, connection) = setup(registry, Duration::from_secs(1));
        let response = dispatcher.dispatch(&connection, "echo.call", b"{\"x\":1}", None).await;
        assert_eq!(response, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn missing_procedure_is_not_found() {
        let (dispatcher, connection) = setup(Registry::new(), Duration::from_secs(1));
        let response = dispatcher.dispatch(&connection, "nope.nope", b"{}", None).await;
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["code"], "NotFound");
    }

    #[tokio::test]
    async fn guard_rejection_is_forbidden() {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("secure")
                .procedure(
                    ProcedureBuilder::new("call", Arc::new(|_ctx, input| Box::pin(async move { Ok(input) })))
                        .guard(Arc::new(|_ctx| Box::pin(async { Ok(false) })))
                        .build(),
                )
                .build(),
        );
        let (dispatcher, connection) = setup(registry, Duration::from_secs(1));
        let response = dispatcher.dispatch(&connection, "secure.call", b"{}", None).await;
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["code"], "Forbidden");
    }

    #[tokio::test]
    async fn validation_error_reports_fields() {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("orders")
                .procedure(
                    ProcedureBuilder::new("create", Arc::new(|_ctx, input| Box::pin(async move { Ok(input) })))
                        .input_schema(Arc::new(ObjectSchema::new().field("id", "number", |v| v.is_number())))
                        .build(),
                )
                .build(),
        );
        let (dispatcher, connection) = setup(registry, Duration::from_secs(1));
        let response = dispatcher.dispatch(&connection, "orders.create", b"{}", None).await;
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["code"], "ValidationError");
    }

    #[tokio::test]
    async fn timeout_surfaces_and_disposes_call_scope() {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("slow")
                .procedure(
                    ProcedureBuilder::new(
                        "call",
                        Arc::new(|_ctx, _input| {
                            Box::pin(async move {
                                tokio::time::sleep(Duration::from_secs(3600)).await;
                                Ok(serde_json::json!(null))
                            })
                        }),
                    )
                    .build(),
                )
                .build(),
        );
        let (dispatcher, connection) = setup(registry, Duration::from_millis(20));
        let response = dispatcher.dispatch(&connection, "slow.call", b"{}", None).await;
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["code"], "Timeout");
    }

    #[tokio::test]
    async fn middlewares_run_outermost_first() {
        let log = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));
        let l1 = log.clone();
        let l2 = log.clone();
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("wrapped")
                .procedure(
                    ProcedureBuilder::new(
                        "call",
                        Arc::new({
                            let log = log.clone();
                            move |_ctx, input| {
                                let log = log.clone();
                                Box::pin(async move {
                                    log.lock().unwrap().push("handler");
                                    Ok(input)
                                })
                            }
                        }),
                    )
                    .middleware(Arc::new(move |ctx, input, next| {
                        let l1 = l1.clone();
                        Box::pin(async move {
                            l1.lock().unwrap().push("outer-before");
                            let r = next(ctx, input).await;
                            l1.lock().unwrap().push("outer-after");
                            r
                        })
                    }))
                    .middleware(Arc::new(move |ctx, input, next| {
                        let l2 = l2.clone();
                        Box::pin(async move {
                            l2.lock().unwrap().push("inner-before");
                            let r = next(ctx, input).await;
                            l2.lock().unwrap().push("inner-after");
                            r
                        })
                    }))
                    .build(),
                )
                .build(),
        );
        let (dispatcher, connection) = setup(registry, Duration::from_secs(1));
        dispatcher.dispatch(&connection, "wrapped.call", b"{}", None).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer-before", "inner-before", "handler", "inner-after", "outer-after"]
        );
    }
}
