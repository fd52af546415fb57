//! Local handler invocation.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::message::{downcast_message, Message};
use crate::middleware::{Middleware, Next};
use crate::stamp::HandledStamp;

/// Processes one message type.
///
/// The output is serialized into the `HandledStamp`; query buses decode it
/// back into the query's `Output`.
///
/// ```ignore
/// struct RegisterUserHandler { db: PgPool }
///
/// #[async_trait::async_trait]
/// impl Handler<RegisterUser> for RegisterUserHandler {
///     type Output = ();
///
///     async fn handle(&self, command: Arc<RegisterUser>) -> anyhow::Result<()> {
///         sqlx::query("INSERT INTO users (email) VALUES ($1)")
///             .bind(&command.email)
///             .execute(&self.db)
///             .await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<M: Message>: Send + Sync + 'static {
    type Output: Serialize + Send + 'static;

    async fn handle(&self, message: Arc<M>) -> anyhow::Result<Self::Output>;
}

type ErasedHandler =
    Arc<dyn Fn(Arc<dyn Message>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Clone)]
struct Registered {
    name: String,
    call: ErasedHandler,
}

/// Handlers keyed by the concrete message type they accept.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Vec<Registered>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its Rust type name.
    pub fn register<M, H>(self, handler: H) -> Self
    where
        M: Message,
        H: Handler<M>,
    {
        self.register_named(std::any::type_name::<H>(), handler)
    }

    pub fn register_named<M, H>(self, name: impl Into<String>, handler: H) -> Self
    where
        M: Message,
        H: Handler<M>,
    {
        let handler = Arc::new(handler);
        self.insert::<M>(
            name.into(),
            Arc::new(move |message: Arc<dyn Message>| {
                let handler = Arc::clone(&handler);
                invoke(message, move |message: Arc<M>| async move {
                    handler.handle(message).await
                })
                .boxed()
            }),
        )
    }

    /// Register an async closure as a handler.
    pub fn register_fn<M, F, Fut, T>(self, name: impl Into<String>, f: F) -> Self
    where
        M: Message,
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert::<M>(
            name.into(),
            Arc::new(move |message: Arc<dyn Message>| {
                let f = Arc::clone(&f);
                invoke(message, move |message: Arc<M>| f(message)).boxed()
            }),
        )
    }

    /// Handlers are told apart by name in `HandledStamp`s, so a name already
    /// taken for `M` gets a `#<n>` suffix.
    fn insert<M: Message>(mut self, name: String, call: ErasedHandler) -> Self {
        let registered = self.handlers.entry(TypeId::of::<M>()).or_default();
        let name = unique_name(registered, name);
        registered.push(Registered { name, call });
        self
    }

    /// Merge another registry's handlers after this one's.
    pub fn merge(mut self, other: HandlerRegistry) -> Self {
        for (type_id, incoming) in other.handlers {
            let registered = self.handlers.entry(type_id).or_default();
            for Registered { name, call } in incoming {
                let name = unique_name(registered, name);
                registered.push(Registered { name, call });
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn handlers_for(&self, message: &dyn Message) -> &[Registered] {
        self.handlers
            .get(&message.as_any().type_id())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn unique_name(registered: &[Registered], name: String) -> String {
    let taken = |candidate: &str| registered.iter().any(|r| r.name == candidate);
    if !taken(&name) {
        return name;
    }

    let renamed = (2..)
        .map(|n| format!("{name}#{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.clone());
    tracing::warn!(handler = %name, renamed = %renamed, "handler name already registered for this message");
    renamed
}

async fn invoke<M, F, Fut, T>(message: Arc<dyn Message>, call: F) -> anyhow::Result<Value>
where
    M: Message,
    F: FnOnce(Arc<M>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    T: Serialize,
{
    let message = downcast_message::<M>(message)
        .ok_or_else(|| anyhow::anyhow!("handler registered for a different message type"))?;
    let output = call(message).await?;
    Ok(serde_json::to_value(output)?)
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .handlers
            .values()
            .flatten()
            .map(|registered| registered.name.as_str())
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

/// Runs every handler registered for the message and records each result as
/// a `HandledStamp`. This is the terminal stage; it does not call `next`.
///
/// A handler already named by a `HandledStamp` on the incoming envelope is
/// skipped, so a redelivered envelope is not processed twice by the same
/// handler.
#[derive(Debug, Clone, Default)]
pub struct HandleMessageMiddleware {
    registry: HandlerRegistry,
    allow_no_handlers: bool,
}

impl HandleMessageMiddleware {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            allow_no_handlers: false,
        }
    }

    /// Accept messages nobody handles. Domain event buses use this.
    pub fn allow_no_handlers(mut self, allow: bool) -> Self {
        self.allow_no_handlers = allow;
        self
    }
}

#[async_trait]
impl Middleware for HandleMessageMiddleware {
    async fn handle(&self, envelope: Envelope, _next: Next) -> Result<Envelope> {
        let handlers = self.registry.handlers_for(envelope.message());

        if handlers.is_empty() {
            if self.allow_no_handlers {
                tracing::debug!(message_name = envelope.message_name(), "no handler for message");
                return Ok(envelope);
            }
            return Err(BusError::NoHandler {
                message: envelope.message_name(),
            });
        }

        let mut envelope = envelope;
        for handler in handlers {
            let already_handled = envelope
                .all::<HandledStamp>()
                .any(|stamp| stamp.handler == handler.name);
            if already_handled {
                continue;
            }

            let result = (handler.call)(envelope.message_arc())
                .await
                .map_err(|source| BusError::Handler {
                    handler: handler.name.clone(),
                    source,
                })?;
            envelope = envelope.with(HandledStamp::new(handler.name.clone(), result));
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MessageBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Add {
        a: i64,
        b: i64,
    }
    crate::impl_query!(Add => i64);

    #[derive(Debug)]
    struct Noticed;
    crate::impl_domain_event!(Noticed);

    struct Adder;

    #[async_trait]
    impl Handler<Add> for Adder {
        type Output = i64;

        async fn handle(&self, query: Arc<Add>) -> anyhow::Result<i64> {
            Ok(query.a + query.b)
        }
    }

    fn bus(stage: HandleMessageMiddleware) -> MessageBus {
        MessageBus::new("handle", vec![Arc::new(stage)])
    }

    #[tokio::test]
    async fn handler_result_is_stamped() {
        let registry = HandlerRegistry::new().register_named("adder", Adder);
        let envelope = bus(HandleMessageMiddleware::new(registry))
            .dispatch(Envelope::new(Add { a: 2, b: 3 }))
            .await
            .unwrap();

        let handled = envelope.last::<HandledStamp>().unwrap();
        assert_eq!(handled.handler, "adder");
        assert_eq!(handled.result, serde_json::json!(5));
    }

    #[tokio::test]
    async fn default_name_is_the_handler_type() {
        let registry = HandlerRegistry::new().register(Adder);
        let envelope = bus(HandleMessageMiddleware::new(registry))
            .dispatch(Envelope::new(Add { a: 1, b: 1 }))
            .await
            .unwrap();

        assert!(envelope.last::<HandledStamp>().unwrap().handler.ends_with("Adder"));
    }

    #[tokio::test]
    async fn every_registered_handler_runs_in_order() {
        let registry = HandlerRegistry::new()
            .register_fn("first", |_: Arc<Noticed>| async { Ok("one") })
            .register_fn("second", |_: Arc<Noticed>| async { Ok("two") });
        let envelope = bus(HandleMessageMiddleware::new(registry))
            .dispatch(Envelope::new(Noticed))
            .await
            .unwrap();

        let names: Vec<_> = envelope.all::<HandledStamp>().map(|s| s.handler.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn handlers_sharing_a_name_both_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (first, second) = (Arc::clone(&calls), Arc::clone(&calls));
        let registry = HandlerRegistry::new()
            .register_fn("audit", move |_: Arc<Noticed>| {
                first.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .merge(HandlerRegistry::new().register_fn("audit", move |_: Arc<Noticed>| {
                second.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }));

        let envelope = bus(HandleMessageMiddleware::new(registry))
            .dispatch(Envelope::new(Noticed))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let names: Vec<_> = envelope.all::<HandledStamp>().map(|s| s.handler.as_str()).collect();
        assert_eq!(names, vec!["audit", "audit#2"]);
    }

    #[tokio::test]
    async fn already_handled_handler_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = HandlerRegistry::new().register_fn("once", move |_: Arc<Noticed>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let envelope = Envelope::new(Noticed).with(HandledStamp::new("once", Value::Null));
        let envelope = bus(HandleMessageMiddleware::new(registry))
            .dispatch(envelope)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(envelope.all::<HandledStamp>().count(), 1);
    }

    #[tokio::test]
    async fn missing_handler_is_an_error_unless_allowed() {
        let err = bus(HandleMessageMiddleware::default())
            .dispatch(Envelope::new(Noticed))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoHandler { message } if message.ends_with("Noticed")));

        let envelope = bus(HandleMessageMiddleware::default().allow_no_handlers(true))
            .dispatch(Envelope::new(Noticed))
            .await
            .unwrap();
        assert!(!envelope.has::<HandledStamp>());
    }

    #[tokio::test]
    async fn failing_handler_stops_the_stage() {
        let registry = HandlerRegistry::new()
            .register_fn("broken", |_: Arc<Noticed>| async {
                Err::<(), _>(anyhow::anyhow!("constraint violated"))
            })
            .register_fn("after", |_: Arc<Noticed>| async { Ok(()) });

        let err = bus(HandleMessageMiddleware::new(registry))
            .dispatch(Envelope::new(Noticed))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Handler { ref handler, .. } if handler == "broken"));
    }

    #[test]
    fn merge_keeps_both_sets() {
        let left = HandlerRegistry::new().register_named("adder", Adder);
        let right = HandlerRegistry::new().register_fn("noticed", |_: Arc<Noticed>| async { Ok(()) });
        let merged = left.merge(right);

        assert_eq!(merged.handlers.len(), 2);
    }
}
