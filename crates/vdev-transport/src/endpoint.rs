//! Endpoint discovery seam.
//!
//! The protocol core never polls instance metadata itself; it is handed an
//! async URL source and re-invokes it on every connect and reconnect attempt.

use std::future::Future;

use async_trait::async_trait;

use crate::error::AgentResult;

/// Source of the WebSocket URL for a device channel.
///
/// Implementations typically resolve the URL from remote instance metadata
/// and may block for as long as it takes the service to assign an endpoint;
/// the connection manager tolerates that and does not bound the call.
#[async_trait]
pub trait EndpointProvider: Send + Sync + 'static {
    /// Resolve the URL to dial for the next connection attempt.
    async fn websocket_url(&self) -> AgentResult<String>;
}

/// Provider for a fixed, already-known URL.
pub struct StaticEndpoint(String);

impl StaticEndpoint {
    /// Create a provider that always returns `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }
}

#[async_trait]
impl EndpointProvider for StaticEndpoint {
    async fn websocket_url(&self) -> AgentResult<String> {
        Ok(self.0.clone())
    }
}

/// Adapter turning an async closure into an [`EndpointProvider`].
pub struct EndpointFn<F>(F);

impl<F, Fut> EndpointFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AgentResult<String>> + Send,
{
    /// Wrap `resolve`, which is re-invoked on every connection attempt.
    pub fn new(resolve: F) -> Self {
        Self(resolve)
    }
}

#[async_trait]
impl<F, Fut> EndpointProvider for EndpointFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AgentResult<String>> + Send,
{
    async fn websocket_url(&self) -> AgentResult<String> {
        (self.0)().await
    }
}
