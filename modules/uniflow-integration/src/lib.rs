//! Downstream delivery: change publishing and integration dispatch.
//!
//! The publisher is the topic boundary between the commit path and
//! everything downstream. It is fire-and-forget with respect to intake,
//! because the record and audit trail are already durable when it runs. The
//! dispatcher consumes notifications and drives each matching integration
//! strategy through bounded retry, isolated from the others.

pub mod dispatcher;
pub mod publisher;
pub mod rest;
pub mod retry;
pub mod strategy;

pub use dispatcher::{Dispatcher, MemoryResultSink, ResultSink, TracingResultSink};
pub use publisher::{
    publish_with_retry, BroadcastPublisher, ChangePublisher, MemoryPublisher, PublishError,
};
pub use rest::{OAuthPasswordConfig, OAuthToken, RestIntegration};
pub use retry::RetryPolicy;
pub use strategy::{ExecuteStatus, IntegrationError, IntegrationStrategy};
