use super::types::{GenerateContentRequest, GenerateContentResponse};
use crate::image::mime;
use crate::{Error, Result, UpstreamError};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub(crate) const PROVIDER: &str = "Gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Lightweight Gemini REST client.
pub struct GeminiHttpClient {
    pub(crate) client: Client,
    pub(crate) api_key: String,
    model: String,
    pub(crate) base_url: String,
    timeout: Duration,
}

/// Image bytes fetched from a remote URL.
pub struct DownloadedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl GeminiHttpClient {
    /// Construct a Gemini client.
    ///
    /// `model` should be the bare model ID (for example `gemini-2.5-pro`),
    /// not a `models/...`-prefixed path segment.
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        Self::new_with_client(api_key, model, timeout, Client::new())
    }

    pub fn new_with_client(
        api_key: String,
        model: String,
        timeout: Duration,
        client: Client,
    ) -> Self {
        let model = model.strip_prefix("models/").unwrap_or(&model).to_string();

        Self {
            client,
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Returns the configured model ID without the `models/` prefix.
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send<Req: Serialize>(&self, url: String, request: &Req) -> Result<Response> {
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send request to Gemini: {}", e);
                UpstreamError::from_reqwest(PROVIDER, e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("Gemini API error (status {}): {}", status, error_text);
            return Err(UpstreamError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                detail: error_text,
            }
            .into());
        }

        Ok(response)
    }

    async fn post_to_url<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        url: String,
        request: &Req,
    ) -> Result<Resp> {
        let exchange = async {
            let response = self.send(url, request).await?;
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
            tracing::error!("Failed to parse Gemini response: {}\nBody: {}", e, body);
            UpstreamError::Malformed {
                provider: PROVIDER,
                detail: e.to_string(),
            }
            .into()
        })
    }

    /// Calls Gemini's `generateContent` endpoint.
    pub async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        self.post_to_url(url, request).await
    }

    /// Calls `streamGenerateContent` in SSE mode; the timeout covers the headers only.
    pub async fn stream_generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<Response> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        tokio::time::timeout(self.timeout, self.send(url, request))
            .await
            .map_err(|_| UpstreamError::Timeout { provider: PROVIDER })?
    }

    /// Fetch an image so it can be sent inline; Gemini does not resolve arbitrary URLs.
    pub async fn download_image(&self, url: &str, max_bytes: usize) -> Result<DownloadedImage> {
        let download = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| UpstreamError::from_reqwest(PROVIDER, e))?;

            if !response.status().is_success() {
                return Err(Error::from(UpstreamError::Status {
                    provider: PROVIDER,
                    status: response.status().as_u16(),
                    detail: format!("image download from {} failed", url),
                }));
            }

            let declared = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

            let mut data = Vec::new();
            let mut body = std::pin::pin!(response.bytes_stream());
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| UpstreamError::from_reqwest(PROVIDER, e))?;
                if data.len() + chunk.len() > max_bytes {
                    return Err(Error::Validation(
                        crate::ValidationError::PayloadTooLarge {
                            size: data.len() + chunk.len(),
                            limit: max_bytes,
                        },
                    ));
                }
                data.extend_from_slice(&chunk);
            }

            Ok::<_, Error>((data, declared))
        };

        let (data, declared) = tokio::time::timeout(self.timeout, download)
            .await
            .map_err(|_| UpstreamError::Timeout { provider: PROVIDER })??;

        let mime_type = mime::detect_image_mime(&data)
            .map(str::to_string)
            .or(declared.filter(|d| mime::is_supported(d)))
            .ok_or_else(|| {
                crate::ValidationError::UnsupportedMediaType(format!(
                    "image at {} is not a supported format",
                    url
                ))
            })?;

        Ok(DownloadedImage { data, mime_type })
    }
}
