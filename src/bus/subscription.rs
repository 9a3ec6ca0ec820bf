//! Subscriptions, topic patterns and the handler trait.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use thiserror::Error;

use super::event::Event;
use super::BusError;

/// Failure raised by a subscriber. Isolated by the bus; never reaches the
/// publisher.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Receives events for the topics it is subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub(crate) u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Ordering and lifetime options for a subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionOptions {
    /// Higher priority handlers run first. Equal priorities keep insertion order.
    pub priority: i32,
    /// Remove the subscription after its first delivery.
    pub once: bool,
}

impl SubscriptionOptions {
    pub fn priority(priority: i32) -> Self {
        Self { priority, once: false }
    }

    pub fn once() -> Self {
        Self { priority: 0, once: true }
    }
}

/// Topic matcher: an exact name or a glob such as `model.*`.
#[derive(Debug, Clone)]
pub enum TopicPattern {
    Exact(String),
    Glob { source: String, matcher: GlobMatcher },
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern cannot be empty".into(),
            });
        }
        if !pattern.contains(['*', '?', '[', '{']) {
            return Ok(Self::Exact(pattern.to_string()));
        }
        let glob = Glob::new(pattern).map_err(|e| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::Glob {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(name) => name == topic,
            Self::Glob { matcher, .. } => matcher.is_match(topic),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(name) => name,
            Self::Glob { source, .. } => source,
        }
    }
}

pub(crate) struct Subscriber {
    pub id: u64,
    pub pattern: TopicPattern,
    pub options: SubscriptionOptions,
    pub handler: Arc<dyn EventHandler>,
}

impl Subscriber {
    pub fn new(
        id: u64,
        pattern: TopicPattern,
        options: SubscriptionOptions,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self { id, pattern, options, handler }
    }
}
