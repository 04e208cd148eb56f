//! REST client for the hub (`/api/states`, `/api/services`)

use super::{HubApi, HubEntityState, HubError, HubServiceDomain};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

pub struct HubClient {
    client: Client,
    address: String,
    access_token: String,
}

impl HubClient {
    pub fn new(address: &str, access_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    /// `{address}/api/{path}`
    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.address, path.trim_start_matches('/'))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    async fn check(response: Response) -> Result<Response, HubError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HubError::Auth(message),
            _ => HubError::Http {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, HubError> {
        let url = self.api_url(path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| HubError::Transport(e.to_string()))?;

        Self::check(response)
            .await?
            .json::<T>()
            .await
            .map_err(|e| HubError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl HubApi for HubClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_states(&self) -> Result<Vec<HubEntityState>, HubError> {
        self.get_json("states").await
    }

    async fn get_services(&self) -> Result<Vec<HubServiceDomain>, HubError> {
        self.get_json("services").await
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, HubError> {
        if domain.is_empty() || service.is_empty() {
            return Err(HubError::InvalidService(format!("{}.{}", domain, service)));
        }
        let url = self.api_url(&format!("services/{}/{}", domain, service));
        debug!("POST {} {}", url, data);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.bearer())
            .json(&data)
            .send()
            .await
            .map_err(|e| HubError::Transport(e.to_string()))?;

        let response = Self::check(response).await?;
        // The hub answers with the list of changed states; an empty body is fine too
        let body = response
            .text()
            .await
            .map_err(|e| HubError::Transport(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| HubError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_joins_cleanly() {
        let client =
            HubClient::new("http://hub.local:8123/", "token", Duration::from_secs(5)).unwrap();
        assert_eq!(client.address(), "http://hub.local:8123");
        assert_eq!(client.api_url("states"), "http://hub.local:8123/api/states");
        assert_eq!(
            client.api_url("/services/light/toggle"),
            "http://hub.local:8123/api/services/light/toggle"
        );
        assert_eq!(client.bearer(), "Bearer token");
    }

    #[tokio::test]
    async fn test_call_service_rejects_empty_names() {
        let client = HubClient::new("http://127.0.0.1:1", "t", Duration::from_millis(50)).unwrap();
        let err = client
            .call_service("", "toggle", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidService(_)));
    }
}
