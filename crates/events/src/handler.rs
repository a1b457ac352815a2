//! Event handler abstraction.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::Event;

/// Consumes events of the types it is subscribed to.
///
/// Handlers run under at-least-once delivery: the retry executor may invoke
/// `handle` several times for the same event, so implementations must be
/// idempotent. The handler name keys its retry bookkeeping and dead letters,
/// and must be unique per event type.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Closure-backed handler, see [`handler_fn`].
pub struct FnHandler<F, Fut> {
    name: String,
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> core::fmt::Debug for FnHandler<F, Fut> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

/// Wrap an async closure as an [`EventHandler`]. The closure receives an owned
/// copy of the event.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}
