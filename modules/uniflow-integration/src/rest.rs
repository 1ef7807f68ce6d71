//! REST integration strategy with OAuth2 password-grant credentials.
//!
//! One instance speaks to one downstream API: acquire a token, map the
//! notification to a request body, send it with bearer auth. The token is
//! cached; `refresh_credentials` drops and re-acquires it, which the
//! dispatcher does before every retry.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uniflow_common::ChangeNotification;

use crate::strategy::{ExecuteStatus, IntegrationError, IntegrationStrategy};

/// OAuth2 password-grant configuration for one downstream API.
#[derive(Debug, Clone)]
pub struct OAuthPasswordConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub token_resource: String,
    pub api_url: String,
    /// Some providers want the grant parameters in the URL query string
    /// instead of a form body.
    pub use_url_params_for_auth: bool,
}

impl OAuthPasswordConfig {
    /// Load one strategy's credentials from `<PREFIX>_CLIENT_ID` etc.
    pub fn from_env(prefix: &str) -> Self {
        Self {
            client_id: required_env(&format!("{prefix}_CLIENT_ID")),
            client_secret: required_env(&format!("{prefix}_CLIENT_SECRET")),
            username: required_env(&format!("{prefix}_USERNAME")),
            password: required_env(&format!("{prefix}_PASSWORD")),
            token_resource: required_env(&format!("{prefix}_TOKEN_RESOURCE")),
            api_url: required_env(&format!("{prefix}_API_URL")),
            use_url_params_for_auth: std::env::var(format!("{prefix}_AUTH_IN_URL"))
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

/// Token returned by the grant endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub instance_url: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub issued_at: Option<String>,
}

/// Maps a change notification to the downstream request body. Returning
/// `None` declares the notification ignored by this strategy.
pub type NotificationMapper = dyn Fn(&ChangeNotification) -> Option<Value> + Send + Sync;

pub struct RestIntegration {
    name: String,
    config: OAuthPasswordConfig,
    method: Method,
    resource: String,
    sub_schema_filter: Option<BTreeSet<String>>,
    mapper: Box<NotificationMapper>,
    http: Client,
    token: Mutex<Option<OAuthToken>>,
}

impl RestIntegration {
    pub fn new(
        name: impl Into<String>,
        config: OAuthPasswordConfig,
        method: Method,
        resource: impl Into<String>,
        http: Client,
        mapper: Box<NotificationMapper>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            method,
            resource: resource.into(),
            sub_schema_filter: None,
            mapper,
            http,
            token: Mutex::new(None),
        }
    }

    /// Only match notifications touching at least one of these sub-schemas.
    pub fn with_sub_schema_filter(
        mut self,
        names: impl IntoIterator<Item = String>,
    ) -> Self {
        self.sub_schema_filter = Some(names.into_iter().collect());
        self
    }

    async fn authenticate(&self) -> Result<OAuthToken, IntegrationError> {
        let params = [
            ("grant_type", "password"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];
        let token_url = format!("{}/{}", self.config.api_url, self.config.token_resource);

        let request = if self.config.use_url_params_for_auth {
            self.http.post(&token_url).query(&params)
        } else {
            self.http.post(&token_url).form(&params)
        };

        let response = request
            .send()
            .await
            .map_err(|e| IntegrationError::Transient(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify(status, format!("authentication failed: {detail}")));
        }

        let token: OAuthToken = response
            .json()
            .await
            .map_err(|e| IntegrationError::Transient(format!("malformed token response: {e}")))?;

        debug!(strategy = self.name.as_str(), "Acquired OAuth token");
        *self.token.lock().await = Some(token.clone());
        Ok(token)
    }

    async fn bearer(&self) -> Result<String, IntegrationError> {
        if let Some(token) = self.token.lock().await.as_ref() {
            return Ok(token.access_token.clone());
        }
        Ok(self.authenticate().await?.access_token)
    }
}

#[async_trait]
impl IntegrationStrategy for RestIntegration {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, notification: &ChangeNotification) -> bool {
        match &self.sub_schema_filter {
            None => true,
            Some(filter) => notification
                .changed_sub_schemas
                .iter()
                .any(|name| filter.contains(name)),
        }
    }

    async fn refresh_credentials(&self) -> Result<(), IntegrationError> {
        self.token.lock().await.take();
        self.authenticate().await.map(|_| ())
    }

    async fn execute(
        &self,
        notification: &ChangeNotification,
    ) -> Result<ExecuteStatus, IntegrationError> {
        let Some(body) = (self.mapper)(notification) else {
            info!(
                strategy = self.name.as_str(),
                identity = %notification.identity_key,
                "Notification ignored by mapping"
            );
            return Ok(ExecuteStatus::Ignored);
        };

        let token = self.bearer().await?;
        let url = format!("{}/{}", self.config.api_url, self.resource);

        let response = self
            .http
            .request(self.method.clone(), &url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| IntegrationError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(ExecuteStatus::Delivered);
        }

        let detail = response.text().await.unwrap_or_default();
        Err(classify(status, detail))
    }
}

/// HTTP status → retriability. 401 is transient because the dispatcher
/// refreshes credentials before the next attempt; other 4xx responses mean
/// the external system rejected the change itself.
fn classify(status: StatusCode, detail: String) -> IntegrationError {
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        IntegrationError::Transient(format!("{status}: {detail}"))
    } else {
        IntegrationError::Terminal(format!("{status}: {detail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet as Set;
    use uniflow_common::IdentityKey;

    fn config() -> OAuthPasswordConfig {
        OAuthPasswordConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            username: "user".into(),
            password: "pass".into(),
            token_resource: "services/oauth2/token".into(),
            api_url: "https://crm.example.org".into(),
            use_url_params_for_auth: true,
        }
    }

    fn strategy(mapper: Box<NotificationMapper>) -> RestIntegration {
        RestIntegration::new(
            "crm-push",
            config(),
            Method::POST,
            "services/data/contacts",
            Client::new(),
            mapper,
        )
    }

    fn notification(names: &[&str]) -> ChangeNotification {
        ChangeNotification {
            identity_key: IdentityKey::from("C1"),
            record_version: 1,
            changed_sub_schemas: names.iter().map(|s| s.to_string()).collect::<Set<_>>(),
        }
    }

    #[test]
    fn no_filter_matches_everything() {
        let s = strategy(Box::new(|_| None));
        assert!(s.matches(&notification(&["profile"])));
    }

    #[test]
    fn filter_requires_an_overlapping_sub_schema() {
        let s = strategy(Box::new(|_| None))
            .with_sub_schema_filter(["contact".to_string()]);
        assert!(s.matches(&notification(&["contact", "profile"])));
        assert!(!s.matches(&notification(&["profile"])));
    }

    #[tokio::test]
    async fn mapper_returning_none_is_ignored_without_network() {
        // api_url points nowhere; the mapper short-circuits before any I/O.
        let s = strategy(Box::new(|_| None));
        let status = s.execute(&notification(&["profile"])).await.unwrap();
        assert_eq!(status, ExecuteStatus::Ignored);
    }

    #[test]
    fn auth_and_rate_limit_statuses_are_transient() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, String::new()),
            IntegrationError::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, String::new()),
            IntegrationError::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, String::new()),
            IntegrationError::Transient(_)
        ));
    }

    #[test]
    fn validation_rejections_are_terminal() {
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, "bad email".to_string()),
            IntegrationError::Terminal(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, String::new()),
            IntegrationError::Terminal(_)
        ));
    }
}
