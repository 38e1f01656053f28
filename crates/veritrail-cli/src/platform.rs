//! Directory-platform HTTP client.
//!
//! Implements [`DirectoryApi`] against the Microsoft identity platform:
//! client-credentials token flow, bearer-authenticated GETs, and
//! `@odata.nextLink` pagination. Transport failures are mapped onto the
//! core's collect-error taxonomy so the orchestrator can decide what to
//! retry.
//!
//! Raw access tokens live only in memory as [`SecretString`] and are
//! never logged or persisted.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use veritrail_core::collector::{CollectError, DirectoryApi};

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const TOKEN_URL_TEMPLATE: &str = "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token";
const TOKEN_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh the token this long before its reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

/// Microsoft Graph client with client-credentials authentication.
pub struct GraphClient {
    http: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: SecretString,
    token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    /// Creates a client for the given tenant and application credentials.
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("veritrail/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret,
            token: Mutex::new(None),
        })
    }

    /// Returns a valid access token, minting a new one when the cached
    /// token is missing or near expiry.
    async fn access_token(&self) -> Result<SecretString, CollectError> {
        {
            let cached = self
                .token
                .lock()
                .map_err(|_| CollectError::Auth("token cache poisoned".to_string()))?;
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                    return Ok(entry.token.clone());
                }
            }
        }

        let url = TOKEN_URL_TEMPLATE.replace("{tenant}", &self.tenant_id);
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", TOKEN_SCOPE),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollectError::Auth(format!(
                "token request failed with {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CollectError::Malformed(format!("token response not JSON: {e}")))?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CollectError::Malformed("token response missing access_token".to_string())
            })?;
        let expires_in = body
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(3600);

        let secret = SecretString::from(token.to_string());
        debug!(expires_in, "access token minted");

        let mut cached = self
            .token
            .lock()
            .map_err(|_| CollectError::Auth("token cache poisoned".to_string()))?;
        *cached = Some(CachedToken {
            token: secret.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(secret)
    }

    async fn get_url(&self, url: &str) -> Result<Value, CollectError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CollectError::Auth(format!("{status} from {url}")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            return Err(CollectError::RateLimited(format!(
                "429 from {url}, retry-after {retry_after}"
            )));
        }
        if !status.is_success() {
            return Err(CollectError::Malformed(format!("{status} from {url}")));
        }

        response
            .json()
            .await
            .map_err(|e| CollectError::Malformed(format!("response from {url} not JSON: {e}")))
    }

    fn absolute(endpoint: &str) -> String {
        if endpoint.starts_with("http") {
            endpoint.to_string()
        } else {
            format!("{GRAPH_BASE_URL}{endpoint}")
        }
    }
}

#[async_trait]
impl DirectoryApi for GraphClient {
    async fn get(&self, endpoint: &str) -> Result<Value, CollectError> {
        self.get_url(&Self::absolute(endpoint)).await
    }

    async fn get_all_pages(&self, endpoint: &str) -> Result<Vec<Value>, CollectError> {
        let mut items = Vec::new();
        let mut next = Some(Self::absolute(endpoint));

        while let Some(url) = next {
            let page = self.get_url(&url).await?;
            match page.get("value").and_then(Value::as_array) {
                Some(values) => items.extend(values.iter().cloned()),
                None => {
                    return Err(CollectError::Malformed(format!(
                        "collection response from {url} has no 'value' array"
                    )));
                }
            }
            next = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(items)
    }

    async fn test_connection(&self) -> bool {
        self.get("/organization?$select=id,displayName").await.is_ok()
    }
}

fn map_transport_error(err: reqwest::Error) -> CollectError {
    if err.is_timeout() || err.is_connect() {
        CollectError::Network(err.to_string())
    } else {
        CollectError::Malformed(err.to_string())
    }
}
