use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use time::format_description::well_known::Rfc3339;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://open-api.123pan.com";
const DEFAULT_WEB_BASE_URL: &str = "https://www.123pan.com";

// Account-login tokens carry no expiry in the response; the provider
// documents them as valid for 30 days.
const ACCOUNT_TOKEN_LIFETIME_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("auth endpoint returned http {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("auth error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("auth response missing data")]
    MissingData,
    #[error("invalid token expiry timestamp: {0}")]
    Expiry(#[from] time::error::Parse),
}

/// A bearer token together with the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

impl AccessToken {
    /// True once the token is inside `window` of its expiry (or past it).
    pub fn expires_within(&self, window: Duration) -> bool {
        OffsetDateTime::now_utc() + window >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenData {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expiredAt")]
    expired_at: String,
}

#[derive(Debug, Deserialize)]
struct SignInData {
    token: String,
}

/// Issues provider tokens. Two routes exist: the open-platform
/// client-credential exchange and the web account sign-in.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
    web_base_url: Url,
}

impl AuthClient {
    pub fn new() -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(DEFAULT_BASE_URL)?,
            web_base_url: Url::parse(DEFAULT_WEB_BASE_URL)?,
        })
    }

    /// Points both token endpoints at one base, for tests against a single
    /// mock server.
    pub fn with_base_url(base_url: &str) -> Result<Self, AuthError> {
        let parsed = Url::parse(base_url)?;
        Ok(Self {
            http: Client::new(),
            base_url: parsed.clone(),
            web_base_url: parsed,
        })
    }

    pub async fn client_credential_token(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<AccessToken, AuthError> {
        let url = self.base_url.join("/api/v1/access_token")?;
        let response = self
            .http
            .post(url)
            .header("Platform", "open_platform")
            .json(&serde_json::json!({
                "clientID": client_id,
                "clientSecret": client_secret,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Http { status, body });
        }
        let envelope = response.json::<Envelope<AccessTokenData>>().await?;
        if envelope.code != 0 {
            return Err(AuthError::Api {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        let data = envelope.data.ok_or(AuthError::MissingData)?;
        let expires_at = OffsetDateTime::parse(&data.expired_at, &Rfc3339)?;
        Ok(AccessToken {
            token: data.access_token,
            expires_at,
        })
    }

    /// Web sign-in. The web API reports success as code 200 inside the
    /// envelope, unlike the open API's code 0.
    pub async fn account_login_token(
        &self,
        passport: &str,
        password: &str,
    ) -> Result<AccessToken, AuthError> {
        let url = self.web_base_url.join("/b/api/user/sign_in")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "type": 1,
                "passport": passport,
                "password": password,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Http { status, body });
        }
        let envelope = response.json::<Envelope<SignInData>>().await?;
        if envelope.code != 200 {
            return Err(AuthError::Api {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        let data = envelope.data.ok_or(AuthError::MissingData)?;
        Ok(AccessToken {
            token: format!("Bearer {}", data.token),
            expires_at: OffsetDateTime::now_utc()
                + Duration::days(ACCOUNT_TOKEN_LIFETIME_DAYS),
        })
    }
}
