//! The integration strategy capability set.

use async_trait::async_trait;
use thiserror::Error;
use uniflow_common::ChangeNotification;

/// How a delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// Worth retrying: network trouble, rate limiting, expired credentials.
    #[error("transient integration failure: {0}")]
    Transient(String),

    /// The external system rejected the change; retrying cannot help.
    #[error("terminal integration failure: {0}")]
    Terminal(String),
}

/// What a successful execution did with the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteStatus {
    /// The change reached the external system.
    Delivered,
    /// The strategy declined the notification (feature-flagged off, nothing
    /// to send). Not a failure.
    Ignored,
}

/// One pluggable delivery mechanism to one external system.
///
/// Strategies read only the immutable notification, never the mutable
/// record, so no lock is held across their network I/O.
#[async_trait]
pub trait IntegrationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this strategy wants the notification at all.
    fn matches(&self, notification: &ChangeNotification) -> bool;

    /// Refresh expiring credentials. The dispatcher calls this before every
    /// retry attempt.
    async fn refresh_credentials(&self) -> Result<(), IntegrationError> {
        Ok(())
    }

    async fn execute(
        &self,
        notification: &ChangeNotification,
    ) -> Result<ExecuteStatus, IntegrationError>;
}
