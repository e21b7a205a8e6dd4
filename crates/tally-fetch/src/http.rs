//! HTTP usage source.
//!
//! Authenticates with the session cookie, discovers the account's
//! organization and reads its usage payload.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, COOKIE};
use serde_json::Value;
use tally_core::UsageReading;
use tracing::debug;

use crate::credentials::{StoredCookie, cookie_header};
use crate::error::{FetchError, Result};
use crate::payload::parse_usage;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can read the current usage for a signed-in session.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn fetch_usage(&self, cookies: &[StoredCookie]) -> Result<UsageReading>;
}

/// [`UsageSource`] backed by the web API.
pub struct HttpUsageClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUsageClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str, cookie: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "Requesting usage endpoint");

        let response = self
            .client
            .get(&url)
            .header(COOKIE, cookie)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        Ok(response.json().await?)
    }

    /// First organization id visible to the session.
    async fn organization_id(&self, cookie: &str) -> Result<String> {
        let orgs = self.get_json("/api/organizations", cookie).await?;
        if let Some(error) = orgs.get("__error") {
            return Err(FetchError::Remote(error.as_str().unwrap_or_default().to_string()));
        }

        orgs.as_array()
            .and_then(|list| list.first())
            .and_then(|org| org.get("uuid").or_else(|| org.get("id")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(FetchError::MissingOrganization)
    }
}

#[async_trait]
impl UsageSource for HttpUsageClient {
    async fn fetch_usage(&self, cookies: &[StoredCookie]) -> Result<UsageReading> {
        if cookies.is_empty() {
            return Err(FetchError::NotSignedIn);
        }
        let cookie = cookie_header(cookies);

        let org = self.organization_id(&cookie).await?;
        let payload = self
            .get_json(&format!("/api/organizations/{org}/usage"), &cookie)
            .await?;
        parse_usage(&payload, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    fn session() -> Vec<StoredCookie> {
        vec![StoredCookie {
            name: "sessionKey".to_string(),
            value: "sk-test".to_string(),
            domain: "127.0.0.1".to_string(),
            path: "/".to_string(),
            expires: None,
            secure: false,
        }]
    }

    #[tokio::test]
    async fn test_fetch_usage_with_mock_server() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/organizations"))
            .and(matchers::header("cookie", "sessionKey=sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"uuid": "org-1"}])))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/organizations/org-1/usage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "five_hour": {"utilization": 30.0, "resets_at": "2026-03-02T14:00:00.5+00:00"},
                "seven_day": {"utilization": 61.0, "resets_at": "2026-03-09T08:00:00+00:00"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = HttpUsageClient::new(mock_server.uri()).unwrap();
        let reading = client.fetch_usage(&session()).await.unwrap();
        assert_eq!(reading.five_hour_percent, Some(30.0));
        assert_eq!(reading.seven_day_percent, Some(61.0));
    }

    #[tokio::test]
    async fn test_connection_refused_is_not_auth_error() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let client = HttpUsageClient::new(format!("http://{addr}")).unwrap();
        let err = client.fetch_usage(&session()).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert!(!err.is_auth_error());
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/organizations"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&mock_server)
            .await;

        let client = HttpUsageClient::new(mock_server.uri()).unwrap();
        let err = client.fetch_usage(&session()).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 401, .. }));
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_no_organization_is_auth_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/organizations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&mock_server)
            .await;

        let client = HttpUsageClient::new(mock_server.uri()).unwrap();
        let err = client.fetch_usage(&session()).await.unwrap_err();
        assert!(matches!(err, FetchError::MissingOrganization));
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_server_error_is_not_auth_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/organizations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "org-2"}])))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/organizations/org-2/usage"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&mock_server)
            .await;

        let client = HttpUsageClient::new(mock_server.uri()).unwrap();
        let err = client.fetch_usage(&session()).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 502, .. }));
        assert!(!err.is_auth_error());
    }

    #[tokio::test]
    async fn test_without_cookies_no_request_is_made() {
        let client = HttpUsageClient::new("http://127.0.0.1:9").unwrap();
        let err = client.fetch_usage(&[]).await.unwrap_err();
        assert!(matches!(err, FetchError::NotSignedIn));
    }
}
