use crate::{Error, Result, UpstreamError};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub(crate) const PROVIDER: &str = "OpenAI";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiHttpClient {
    pub(crate) client: Client,
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    timeout: Duration,
}

impl OpenAiHttpClient {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self::new_with_client(api_key, timeout, Client::new())
    }

    pub fn new_with_client(api_key: String, timeout: Duration, client: Client) -> Self {
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout,
        }
    }

    /// Point at an OpenAI-compatible endpoint, e.g. `http://localhost:8080/v1`.
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn send<Req: Serialize>(&self, path: &str, request: &Req) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send request to OpenAI: {}", e);
                UpstreamError::from_reqwest(PROVIDER, e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("OpenAI API error (status {}): {}", status, error_text);
            return Err(UpstreamError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                detail: error_text,
            }
            .into());
        }

        Ok(response)
    }

    pub async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp> {
        let exchange = async {
            let response = self.send(path, request).await?;
            let body = response
                .text()
                .await
                .map_err(|e| UpstreamError::from_reqwest(PROVIDER, e))?;
            Ok::<_, Error>(body)
        };
        let body = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout { provider: PROVIDER })??;

        serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Failed to parse OpenAI response: {}\nBody: {}", e, body);
            UpstreamError::Malformed {
                provider: PROVIDER,
                detail: e.to_string(),
            }
            .into()
        })
    }

    /// Send a streaming request; the timeout covers only receiving the headers.
    pub async fn post_stream<Req: Serialize>(&self, path: &str, request: &Req) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.send(path, request))
            .await
            .map_err(|_| UpstreamError::Timeout { provider: PROVIDER })?
    }
}
