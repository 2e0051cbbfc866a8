use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use courier_core::HandlerResult;

use crate::envelope::{Headers, MessageEnvelope};

/// Everything a handler knows about one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    pub envelope: MessageEnvelope,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub routing_key: String,
    pub exchange: String,
    pub headers: Headers,
    pub retry_count: u32,
}

impl MessageContext {
    /// Context for an envelope that did not come off a broker (tests, replays).
    pub fn detached(envelope: MessageEnvelope) -> Self {
        Self {
            routing_key: envelope.event_type().to_owned(),
            headers: envelope.headers(),
            retry_count: envelope.retry_count(),
            envelope,
            delivery_tag: 0,
            redelivered: false,
            exchange: String::new(),
        }
    }

    pub fn event_type(&self) -> &str {
        self.envelope.event_type()
    }
}

/// Processes one kind of event.
///
/// Delivery is at-least-once: the same envelope (same `event_id`) can reach a handler
/// more than once after redeliveries or outbox replays, so handlers must be idempotent.
/// Return a rejection variant of [`courier_core::HandlerError`] for input that will
/// never succeed; anything else is retried.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext) -> HandlerResult;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct HandlerFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap a closure taking an owned [`MessageContext`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F, Fut>
where
    F: Fn(MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    HandlerFn {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F, Fut>
where
    F: Fn(MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: &MessageContext) -> HandlerResult {
        (self.f)(ctx.clone()).await
    }
}
