//! reqwest implementation of [`WalkApi`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawtrail_common::config::ApiConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use super::{
    CancelRequest, CreateWalkRequest, CreateWalkResponse, MatchRequest, RemoteError, RemoteWalk,
    SamplePayload, UploadResponse, WalkApi,
};

const USER_AGENT: &str = concat!("pawtrail-tracker/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the remote walk API
pub struct HttpWalkApi {
    http_client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpWalkApi {
    pub fn new(config: &ApiConfig) -> Result<Self, RemoteError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || code == 429 {
            Err(RemoteError::Unavailable(code, body))
        } else {
            Err(RemoteError::Rejected(code, body))
        }
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        tracing::debug!(url = %url, "POST walk API");
        let response = self.send(self.http_client.post(&url).json(body)).await?;
        response
            .json::<R>()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))
    }

    async fn post_empty<B>(&self, path: &str, body: Option<&B>) -> Result<(), RemoteError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        tracing::debug!(url = %url, "POST walk API");
        let mut request = self.http_client.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await.map(|_| ())
    }
}

#[async_trait]
impl WalkApi for HttpWalkApi {
    async fn create_walk(&self, request: &CreateWalkRequest) -> Result<Uuid, RemoteError> {
        let response: CreateWalkResponse = self.post_json("/walks", request).await?;
        Ok(response.session_id)
    }

    async fn match_walker(&self, session_id: Uuid, walker_id: Uuid) -> Result<(), RemoteError> {
        self.post_empty(
            &format!("/walks/{}/match", session_id),
            Some(&MatchRequest { walker_id }),
        )
        .await
    }

    async fn upload_locations(
        &self,
        session_id: Uuid,
        samples: &[SamplePayload],
    ) -> Result<Option<DateTime<Utc>>, RemoteError> {
        let response: UploadResponse = self
            .post_json(&format!("/walks/{}/locations", session_id), samples)
            .await?;
        Ok(response.acknowledged_up_to)
    }

    async fn start_walk(&self, session_id: Uuid) -> Result<(), RemoteError> {
        self.post_empty::<()>(&format!("/walks/{}/start", session_id), None)
            .await
    }

    async fn end_walk(&self, session_id: Uuid) -> Result<(), RemoteError> {
        self.post_empty::<()>(&format!("/walks/{}/end", session_id), None)
            .await
    }

    async fn cancel_walk(&self, session_id: Uuid, request: &CancelRequest) -> Result<(), RemoteError> {
        self.post_empty(&format!("/walks/{}/cancel", session_id), Some(request))
            .await
    }

    async fn list_in_flight(&self, account_id: Uuid) -> Result<Vec<RemoteWalk>, RemoteError> {
        let url = self.url("/walks");
        tracing::debug!(url = %url, account_id = %account_id, "Listing in-flight walks");
        let request = self
            .http_client
            .get(&url)
            .query(&[("account", account_id.to_string()), ("in_flight", "true".to_string())]);
        let response = self.send(request).await?;
        response
            .json::<Vec<RemoteWalk>>()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))
    }
}
