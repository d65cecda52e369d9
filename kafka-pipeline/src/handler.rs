use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::InboundMessage;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(#[from] anyhow::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Application logic invoked by the worker pool, once per consumed message.
///
/// Calls on one worker are sequential; different workers call concurrently. A panic inside
/// `handle` is caught by the worker and reported as [`HandlerError::Panicked`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError>;
}

pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        (self.f)(message).await
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
