use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BrowserError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorSession {
    pub id: String,
    #[serde(alias = "cdpUrl", alias = "wsEndpoint", alias = "connectUrl")]
    pub connect_url: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    #[serde(alias = "items", alias = "data", default)]
    pub sessions: Vec<ListedSession>,
    #[serde(default)]
    pub total_items: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedSession {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// The contract the broker needs from a remote browser vendor.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<VendorSession>;
    async fn stop_session(&self, session_id: &str) -> Result<()>;
    async fn list_sessions(&self, page_size: u32, page_number: u32) -> Result<SessionPage>;
}

pub struct VendorClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl VendorClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrowserError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(BrowserError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SessionProvider for VendorClient {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<VendorSession> {
        debug!(
            profile = ?request.profile_id,
            proxy = ?request.proxy_country_code,
            "creating browser session"
        );
        let resp = self
            .client
            .post(format!("{}/browsers", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn stop_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .client
            .patch(format!("{}/browsers/{session_id}", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({ "action": "stop" }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_sessions(&self, page_size: u32, page_number: u32) -> Result<SessionPage> {
        let resp = self
            .client
            .get(format!("{}/browsers", self.base_url))
            .header("x-api-key", &self.api_key)
            .query(&[("pageSize", page_size), ("pageNumber", page_number)])
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_omits_disabled_identity_fields() {
        let body = serde_json::to_value(CreateSessionRequest {
            profile_id: None,
            proxy_country_code: Some("de".into()),
            timeout: Some(300),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "proxyCountryCode": "de", "timeout": 300 }));
    }

    #[test]
    fn session_payload_accepts_vendor_aliases() {
        let session: VendorSession =
            serde_json::from_str(r#"{"id":"b-1","cdpUrl":"wss://cdp.example/b-1"}"#).unwrap();
        assert_eq!(session.connect_url, "wss://cdp.example/b-1");

        let page: SessionPage =
            serde_json::from_str(r#"{"items":[{"id":"b-1","status":"running"}],"totalItems":1}"#).unwrap();
        assert_eq!(page.sessions.len(), 1);
        assert_eq!(page.total_items, Some(1));
    }
}
