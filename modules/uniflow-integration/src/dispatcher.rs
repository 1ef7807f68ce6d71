//! Integration dispatcher: one notification, every matching strategy,
//! bounded retry, full isolation between strategies.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uniflow_common::{ChangeNotification, IdentityKey, IntegrationResult, IntegrationStatus};

use crate::retry::RetryPolicy;
use crate::strategy::{ExecuteStatus, IntegrationError, IntegrationStrategy};

/// Where terminal integration results land.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, result: IntegrationResult);
}

/// Keeps results in memory, with assertion accessors.
#[derive(Default)]
pub struct MemoryResultSink {
    results: Mutex<Vec<IntegrationResult>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<IntegrationResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn for_strategy(&self, name: &str) -> Vec<IntegrationResult> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.strategy_name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn record(&self, result: IntegrationResult) {
        self.results.lock().unwrap().push(result);
    }
}

/// Logs each terminal result. The default sink when nothing else is wired.
pub struct TracingResultSink;

#[async_trait]
impl ResultSink for TracingResultSink {
    async fn record(&self, result: IntegrationResult) {
        info!(
            identity = %result.identity_key,
            record_version = result.record_version,
            strategy = result.strategy_name.as_str(),
            status = ?result.status,
            attempts = result.attempts,
            last_error = result.last_error.as_deref().unwrap_or(""),
            "Integration result"
        );
    }
}

/// Fans one notification out to every matching strategy and drives each
/// through `pending -> retrying* -> {success | failed | ignored}`.
///
/// Once a (identity, version, strategy) tuple is terminal it is never
/// re-entered: a redelivered notification is skipped per strategy, and a
/// later record version is a fresh tuple.
pub struct Dispatcher {
    strategies: Vec<Arc<dyn IntegrationStrategy>>,
    policy: RetryPolicy,
    sink: Arc<dyn ResultSink>,
    terminal: Mutex<HashSet<(IdentityKey, i64, String)>>,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            strategies: Vec::new(),
            policy,
            sink,
            terminal: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn IntegrationStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Deliver one notification. Matching strategies run concurrently; one
    /// strategy's failure never blocks or alters another's outcome.
    pub async fn dispatch(&self, notification: &ChangeNotification) -> Vec<IntegrationResult> {
        let due: Vec<&Arc<dyn IntegrationStrategy>> = self
            .strategies
            .iter()
            .filter(|s| s.matches(notification))
            .filter(|s| {
                let tuple = (
                    notification.identity_key.clone(),
                    notification.record_version,
                    s.name().to_string(),
                );
                let already = self.terminal.lock().unwrap().contains(&tuple);
                if already {
                    debug!(
                        strategy = s.name(),
                        identity = %notification.identity_key,
                        record_version = notification.record_version,
                        "Result already terminal, skipping redelivery"
                    );
                }
                !already
            })
            .collect();

        let results = join_all(
            due.iter()
                .map(|strategy| self.drive(strategy.as_ref(), notification)),
        )
        .await;

        for result in &results {
            self.terminal.lock().unwrap().insert((
                result.identity_key.clone(),
                result.record_version,
                result.strategy_name.clone(),
            ));
            self.sink.record(result.clone()).await;
        }
        results
    }

    /// Consume notifications from a broadcast topic until shutdown. An
    /// in-flight dispatch finishes before the loop stops.
    pub async fn run(
        &self,
        mut rx: broadcast::Receiver<ChangeNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
                next = rx.recv() => match next {
                    Ok(notification) => {
                        self.dispatch(&notification).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Change topic lagged; relying on reconciliation");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn drive(
        &self,
        strategy: &dyn IntegrationStrategy,
        notification: &ChangeNotification,
    ) -> IntegrationResult {
        let mut attempts = 0;
        let mut last_error = None;

        let status = loop {
            attempts += 1;

            // Credentials may have expired while we were backing off.
            let outcome = if attempts > 1 {
                match strategy.refresh_credentials().await {
                    Ok(()) => strategy.execute(notification).await,
                    Err(e) => Err(e),
                }
            } else {
                strategy.execute(notification).await
            };

            match outcome {
                Ok(ExecuteStatus::Delivered) => break IntegrationStatus::Success,
                Ok(ExecuteStatus::Ignored) => break IntegrationStatus::Ignored,
                Err(IntegrationError::Terminal(msg)) => {
                    last_error = Some(msg);
                    break IntegrationStatus::Failed;
                }
                Err(IntegrationError::Transient(msg)) => {
                    last_error = Some(msg);
                    if attempts >= self.policy.max_attempts {
                        break IntegrationStatus::Failed;
                    }
                    warn!(
                        strategy = strategy.name(),
                        identity = %notification.identity_key,
                        attempt = attempts,
                        "Transient integration failure, backing off"
                    );
                    tokio::time::sleep(self.policy.delay_for(attempts)).await;
                }
            }
        };

        IntegrationResult {
            identity_key: notification.identity_key.clone(),
            record_version: notification.record_version,
            strategy_name: strategy.name().to_string(),
            status,
            attempts,
            last_error,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn notification(version: i64) -> ChangeNotification {
        ChangeNotification {
            identity_key: IdentityKey::from("C1"),
            record_version: version,
            changed_sub_schemas: BTreeSet::from(["profile".to_string()]),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::ZERO, 2)
    }

    /// Strategy whose execute outcomes are scripted up front.
    struct ScriptedStrategy {
        name: String,
        script: Mutex<VecDeque<Result<ExecuteStatus, IntegrationError>>>,
        refreshes: AtomicU32,
    }

    impl ScriptedStrategy {
        fn new(
            name: &str,
            script: Vec<Result<ExecuteStatus, IntegrationError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                refreshes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl IntegrationStrategy for ScriptedStrategy {
        fn name(&self) -> &str {
            &self.name
        }

        fn matches(&self, _notification: &ChangeNotification) -> bool {
            true
        }

        async fn refresh_credentials(&self) -> Result<(), IntegrationError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &self,
            _notification: &ChangeNotification,
        ) -> Result<ExecuteStatus, IntegrationError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(IntegrationError::Transient("script exhausted".into())))
        }
    }

    fn transient(msg: &str) -> Result<ExecuteStatus, IntegrationError> {
        Err(IntegrationError::Transient(msg.to_string()))
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_on_attempt_three() {
        let strategy = ScriptedStrategy::new(
            "crm-push",
            vec![
                transient("timeout"),
                transient("rate limited"),
                Ok(ExecuteStatus::Delivered),
            ],
        );
        let sink = Arc::new(MemoryResultSink::new());
        let dispatcher =
            Dispatcher::new(fast_policy(), sink.clone()).with_strategy(strategy.clone());

        let results = dispatcher.dispatch(&notification(1)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, IntegrationStatus::Success);
        assert_eq!(results[0].attempts, 3);
        // A refresh ran before each of the two retries.
        assert_eq!(strategy.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminal_failure_stops_immediately_with_the_error_captured() {
        let strategy = ScriptedStrategy::new(
            "crm-push",
            vec![Err(IntegrationError::Terminal("422: bad payload".into()))],
        );
        let sink = Arc::new(MemoryResultSink::new());
        let dispatcher = Dispatcher::new(fast_policy(), sink.clone()).with_strategy(strategy);

        let results = dispatcher.dispatch(&notification(1)).await;
        assert_eq!(results[0].status, IntegrationStatus::Failed);
        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[0].last_error.as_deref(), Some("422: bad payload"));
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_attempt_cap() {
        let strategy = ScriptedStrategy::new(
            "crm-push",
            vec![
                transient("1"),
                transient("2"),
                transient("3"),
                transient("4"),
                transient("5"),
            ],
        );
        let sink = Arc::new(MemoryResultSink::new());
        let dispatcher = Dispatcher::new(fast_policy(), sink.clone()).with_strategy(strategy);

        let results = dispatcher.dispatch(&notification(1)).await;
        assert_eq!(results[0].status, IntegrationStatus::Failed);
        assert_eq!(results[0].attempts, 5);
    }

    #[tokio::test]
    async fn failing_strategy_does_not_alter_an_independent_one() {
        let failing = ScriptedStrategy::new(
            "flaky",
            vec![transient("1"), transient("2"), transient("3"), transient("4"), transient("5")],
        );
        let steady = ScriptedStrategy::new("steady", vec![Ok(ExecuteStatus::Delivered)]);
        let sink = Arc::new(MemoryResultSink::new());
        let dispatcher = Dispatcher::new(fast_policy(), sink.clone())
            .with_strategy(failing)
            .with_strategy(steady);

        dispatcher.dispatch(&notification(1)).await;

        let steady_results = sink.for_strategy("steady");
        assert_eq!(steady_results.len(), 1);
        assert_eq!(steady_results[0].status, IntegrationStatus::Success);
        assert_eq!(steady_results[0].attempts, 1);

        let flaky_results = sink.for_strategy("flaky");
        assert_eq!(flaky_results[0].status, IntegrationStatus::Failed);
    }

    #[tokio::test]
    async fn ignored_is_terminal_and_not_a_failure() {
        let strategy = ScriptedStrategy::new("flagged-off", vec![Ok(ExecuteStatus::Ignored)]);
        let sink = Arc::new(MemoryResultSink::new());
        let dispatcher = Dispatcher::new(fast_policy(), sink.clone()).with_strategy(strategy);

        let results = dispatcher.dispatch(&notification(1)).await;
        assert_eq!(results[0].status, IntegrationStatus::Ignored);
        assert_eq!(results[0].last_error, None);
    }

    #[tokio::test]
    async fn redelivered_notification_does_not_rerun_a_terminal_strategy() {
        let strategy = ScriptedStrategy::new(
            "crm-push",
            vec![Ok(ExecuteStatus::Delivered), Ok(ExecuteStatus::Delivered)],
        );
        let sink = Arc::new(MemoryResultSink::new());
        let dispatcher = Dispatcher::new(fast_policy(), sink.clone()).with_strategy(strategy);

        dispatcher.dispatch(&notification(1)).await;
        let second = dispatcher.dispatch(&notification(1)).await;
        assert!(second.is_empty());
        assert_eq!(sink.all().len(), 1);
    }

    #[tokio::test]
    async fn later_record_version_is_a_fresh_tuple() {
        let strategy = ScriptedStrategy::new(
            "crm-push",
            vec![Ok(ExecuteStatus::Delivered), Ok(ExecuteStatus::Delivered)],
        );
        let sink = Arc::new(MemoryResultSink::new());
        let dispatcher = Dispatcher::new(fast_policy(), sink.clone()).with_strategy(strategy);

        dispatcher.dispatch(&notification(1)).await;
        dispatcher.dispatch(&notification(2)).await;
        assert_eq!(sink.all().len(), 2);
    }
}
