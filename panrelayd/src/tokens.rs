use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use panrelay_core::{AccessToken, AuthClient, AuthError};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::backoff::Backoff;
use crate::config::GlobalCredentials;
use crate::store::{StoreError, TaskStore};

const FETCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no provider credentials configured for owner '{0}'")]
    MissingCredentials(String),
    #[error("provider rejected credentials: {0}")]
    Rejected(String),
    #[error("token endpoint unreachable: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<AuthError> for TokenError {
    fn from(err: AuthError) -> Self {
        match &err {
            AuthError::Request(_) => TokenError::Transient(err.to_string()),
            AuthError::Http { status, .. } if status.is_server_error() => {
                TokenError::Transient(err.to_string())
            }
            _ => TokenError::Rejected(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
enum Credentials {
    ClientPair { id: String, secret: String },
    Account { username: String, password: String },
}

/// Per-owner token cache. Tokens are refreshed ahead of expiry by a
/// configurable skew, and concurrent callers for the same owner share one
/// refresh instead of racing the auth endpoint.
pub struct TokenManager {
    auth: AuthClient,
    store: Arc<TaskStore>,
    global: GlobalCredentials,
    skew: time::Duration,
    backoff: Backoff,
    slots: Mutex<HashMap<String, Arc<Mutex<Option<AccessToken>>>>>,
}

impl TokenManager {
    pub fn new(
        auth: AuthClient,
        store: Arc<TaskStore>,
        global: GlobalCredentials,
        skew: Duration,
    ) -> Self {
        Self {
            auth,
            store,
            global,
            skew: time::Duration::seconds(skew.as_secs().min(i64::MAX as u64) as i64),
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(2), true),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn token_for(&self, owner_id: &str) -> Result<String, TokenError> {
        let slot = self.slot(owner_id).await;
        let mut guard = slot.lock().await;
        // Re-check after acquiring: a concurrent caller may have refreshed
        // while this one waited on the lock.
        if let Some(token) = guard.as_ref()
            && !token.expires_within(self.skew)
        {
            return Ok(token.token.clone());
        }

        let credentials = self.credentials_for(owner_id).await?;
        let token = self.fetch_with_retry(&credentials).await?;
        let value = token.token.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// Drops the cached token so the next call fetches a fresh one. Called
    /// when the provider rejects a token the cache still considered valid.
    pub async fn invalidate(&self, owner_id: &str) {
        let slot = self.slot(owner_id).await;
        let mut guard = slot.lock().await;
        *guard = None;
    }

    async fn slot(&self, owner_id: &str) -> Arc<Mutex<Option<AccessToken>>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn credentials_for(&self, owner_id: &str) -> Result<Credentials, TokenError> {
        if let Some(tenant) = self.store.get_tenant(owner_id).await? {
            if let (Some(id), Some(secret)) = (tenant.client_id, tenant.client_secret) {
                return Ok(Credentials::ClientPair { id, secret });
            }
            if let (Some(username), Some(password)) = (tenant.username, tenant.password) {
                return Ok(Credentials::Account { username, password });
            }
        }
        if let (Some(id), Some(secret)) = (
            self.global.client_id.clone(),
            self.global.client_secret.clone(),
        ) {
            return Ok(Credentials::ClientPair { id, secret });
        }
        if let (Some(username), Some(password)) =
            (self.global.username.clone(), self.global.password.clone())
        {
            return Ok(Credentials::Account { username, password });
        }
        Err(TokenError::MissingCredentials(owner_id.to_string()))
    }

    async fn fetch_with_retry(&self, credentials: &Credentials) -> Result<AccessToken, TokenError> {
        let mut attempt = 0;
        loop {
            match self.fetch(credentials).await {
                Ok(token) => return Ok(token),
                Err(err @ TokenError::Transient(_)) if attempt + 1 < FETCH_ATTEMPTS => {
                    tracing::warn!(attempt, error = %err, "token fetch failed, retrying");
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch(&self, credentials: &Credentials) -> Result<AccessToken, TokenError> {
        match credentials {
            Credentials::ClientPair { id, secret } => {
                Ok(self.auth.client_credential_token(id, secret).await?)
            }
            Credentials::Account { username, password } => {
                Ok(self.auth.account_login_token(username, password).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TenantRecord;
    use serde_json::json;
    use sqlx::SqlitePool;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_store() -> Arc<TaskStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = TaskStore::from_pool(pool);
        store.init().await.unwrap();
        Arc::new(store)
    }

    fn token_body(token: &str, expired_at: &str) -> serde_json::Value {
        json!({
            "code": 0,
            "message": "ok",
            "data": { "accessToken": token, "expiredAt": expired_at }
        })
    }

    #[tokio::test]
    async fn caches_token_until_skew_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok-1", "2030-01-01T00:00:00Z")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let manager = TokenManager::new(
            AuthClient::with_base_url(&server.uri()).unwrap(),
            make_store().await,
            GlobalCredentials {
                client_id: Some("cid".into()),
                client_secret: Some("secret".into()),
                ..Default::default()
            },
            Duration::from_secs(3600),
        );

        assert_eq!(manager.token_for("global").await.unwrap(), "tok-1");
        assert_eq!(manager.token_for("global").await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn concurrent_burst_performs_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok-burst", "2030-01-01T00:00:00Z"))
                    .set_delay(std::time::Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let manager = Arc::new(TokenManager::new(
            AuthClient::with_base_url(&server.uri()).unwrap(),
            make_store().await,
            GlobalCredentials {
                client_id: Some("cid".into()),
                client_secret: Some("secret".into()),
                ..Default::default()
            },
            Duration::from_secs(3600),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.token_for("global").await },
            ));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "tok-burst");
        }
    }

    #[tokio::test]
    async fn refreshes_token_inside_skew_window() {
        let server = MockServer::start().await;
        // Expiry is one minute out while the skew is an hour, so every call
        // refreshes.
        let soon = (time::OffsetDateTime::now_utc() + time::Duration::minutes(1))
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap();
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-2", &soon)))
            .expect(2)
            .mount(&server)
            .await;

        let manager = TokenManager::new(
            AuthClient::with_base_url(&server.uri()).unwrap(),
            make_store().await,
            GlobalCredentials {
                client_id: Some("cid".into()),
                client_secret: Some("secret".into()),
                ..Default::default()
            },
            Duration::from_secs(3600),
        );

        manager.token_for("global").await.unwrap();
        manager.token_for("global").await.unwrap();
    }

    #[tokio::test]
    async fn tenant_credentials_override_global() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .and(body_json(json!({
                "clientID": "tenant-cid",
                "clientSecret": "tenant-secret"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tenant-tok", "2030-01-01T00:00:00Z")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = make_store().await;
        store
            .upsert_tenant(&TenantRecord {
                owner_id: "studio-a".into(),
                client_id: Some("tenant-cid".into()),
                client_secret: Some("tenant-secret".into()),
                username: None,
                password: None,
                root_dir_id: None,
            })
            .await
            .unwrap();

        let manager = TokenManager::new(
            AuthClient::with_base_url(&server.uri()).unwrap(),
            store,
            GlobalCredentials {
                client_id: Some("global-cid".into()),
                client_secret: Some("global-secret".into()),
                ..Default::default()
            },
            Duration::from_secs(3600),
        );

        assert_eq!(manager.token_for("studio-a").await.unwrap(), "tenant-tok");
    }

    #[tokio::test]
    async fn missing_credentials_is_reported_per_owner() {
        let server = MockServer::start().await;
        let manager = TokenManager::new(
            AuthClient::with_base_url(&server.uri()).unwrap(),
            make_store().await,
            GlobalCredentials::default(),
            Duration::from_secs(3600),
        );

        let err = manager.token_for("nobody").await.unwrap_err();
        assert!(matches!(err, TokenError::MissingCredentials(owner) if owner == "nobody"));
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok-3", "2030-01-01T00:00:00Z")),
            )
            .expect(2)
            .mount(&server)
            .await;

        let manager = TokenManager::new(
            AuthClient::with_base_url(&server.uri()).unwrap(),
            make_store().await,
            GlobalCredentials {
                client_id: Some("cid".into()),
                client_secret: Some("secret".into()),
                ..Default::default()
            },
            Duration::from_secs(3600),
        );

        manager.token_for("global").await.unwrap();
        manager.invalidate("global").await;
        manager.token_for("global").await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials_do_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 401,
                "message": "client secret invalid",
                "data": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = TokenManager::new(
            AuthClient::with_base_url(&server.uri()).unwrap(),
            make_store().await,
            GlobalCredentials {
                client_id: Some("cid".into()),
                client_secret: Some("wrong".into()),
                ..Default::default()
            },
            Duration::from_secs(3600),
        );

        let err = manager.token_for("global").await.unwrap_err();
        assert!(matches!(err, TokenError::Rejected(_)));
    }
}
