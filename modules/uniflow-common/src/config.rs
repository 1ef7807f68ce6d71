use std::env;

use tracing::info;

/// Pipeline configuration loaded from environment variables.
///
/// Transport and store clients are constructed once at process start from
/// these values and passed into the adapters that need them. Nothing in
/// the pipeline reads ambient state after startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Record + audit store (Postgres)
    pub store_url: String,

    // Intake
    pub intake_queue: String,
    pub intake_batch_size: usize,

    // Change topic
    pub publish_topic: String,
    pub publish_capacity: usize,

    // Commit retry (optimistic-concurrency conflicts)
    pub max_commit_attempts: u32,

    // Integration retry
    pub max_integration_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: u32,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            store_url: required_env("UNIFLOW_STORE_URL"),
            intake_queue: env::var("UNIFLOW_INTAKE_QUEUE")
                .unwrap_or_else(|_| "client-events".to_string()),
            intake_batch_size: parsed_env("UNIFLOW_INTAKE_BATCH_SIZE", 16),
            publish_topic: env::var("UNIFLOW_PUBLISH_TOPIC")
                .unwrap_or_else(|_| "client-changes".to_string()),
            publish_capacity: parsed_env("UNIFLOW_PUBLISH_CAPACITY", 256),
            max_commit_attempts: parsed_env("UNIFLOW_MAX_COMMIT_ATTEMPTS", 3),
            max_integration_attempts: parsed_env("UNIFLOW_MAX_INTEGRATION_ATTEMPTS", 5),
            backoff_base_ms: parsed_env("UNIFLOW_BACKOFF_BASE_MS", 500),
            backoff_multiplier: parsed_env("UNIFLOW_BACKOFF_MULTIPLIER", 2),
        }
    }

    /// Log the non-secret parts of the configuration at startup.
    pub fn log_redacted(&self) {
        info!(
            intake_queue = self.intake_queue.as_str(),
            publish_topic = self.publish_topic.as_str(),
            intake_batch_size = self.intake_batch_size,
            max_commit_attempts = self.max_commit_attempts,
            max_integration_attempts = self.max_integration_attempts,
            backoff_base_ms = self.backoff_base_ms,
            "Loaded configuration (store URL redacted)"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Debug,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{key} must be a number: {e:?}")),
        Err(_) => default,
    }
}
