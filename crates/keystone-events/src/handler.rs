//! Event handler trait and closure adapter.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::HandlerError;
use crate::event::Event;

/// Trait for event handler implementations.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one delivered event.
    ///
    /// Returning an error triggers the bus retry policy.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

type BoxedFn = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// A closure-based event handler for quick handler creation.
pub struct FnHandler {
    handler: BoxedFn,
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("handler", &"<closure>")
            .finish()
    }
}

impl FnHandler {
    /// Creates a new closure-based handler.
    ///
    /// The closure receives an owned clone of the event.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |event| Box::pin(handler(event))),
        }
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.handler)(event.clone()).await
    }
}

/// Wraps a closure into an `Arc<dyn EventHandler>`.
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler::new(handler))
}
