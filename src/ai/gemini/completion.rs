use super::client::{GeminiHttpClient, PROVIDER};
use super::types::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData, Part,
    UsageMetadata,
};
use crate::ai::types::{
    ChatCompletionRequest, ChatMessage, CompletionChunk, CompletionResponse, ContentPart,
    MessageContent, Usage,
};
use crate::ai::{fuse_on_error, sse, ChunkStream, CompletionService};
use crate::image::{data_url, mime};
use crate::{Error, Result, UpstreamError};
use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use std::time::Duration;

const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const NO_TURN_CONTENT: &str = "request has no user or assistant content to send";

/// Translates OpenAI-shaped requests into Gemini `generateContent` calls.
pub struct GeminiCompletionClient {
    http: GeminiHttpClient,
    max_image_bytes: usize,
}

impl GeminiCompletionClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        Self::new_with_client(api_key, model, timeout, reqwest::Client::new())
    }

    pub fn new_with_client(
        api_key: String,
        model: String,
        timeout: Duration,
        client: reqwest::Client,
    ) -> Self {
        Self {
            http: GeminiHttpClient::new_with_client(api_key, model, timeout, client),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.http = self.http.with_base_url(base_url);
        self
    }

    /// Upper bound for images downloaded from remote URLs.
    pub fn with_max_image_bytes(mut self, max_image_bytes: usize) -> Self {
        self.max_image_bytes = max_image_bytes;
        self
    }

    async fn translate(&self, request: &ChatCompletionRequest) -> Result<GenerateContentRequest> {
        reject_tools(request)?;
        let mut system_parts = Vec::new();
        let mut contents: Vec<Content> = Vec::new();

        for message in &request.messages {
            if message.is_system() {
                let text = message.text_content();
                if !text.is_empty() {
                    system_parts.push(Part::Text { text });
                }
                continue;
            }

            let role = match message.role.as_str() {
                "assistant" => "model",
                _ => "user",
            };
            let parts = self.translate_parts(message).await?;
            if parts.is_empty() {
                continue;
            }

            // Gemini expects alternating turns, so consecutive same-role messages merge.
            match contents.last_mut() {
                Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
                _ => contents.push(Content {
                    role: Some(role.to_string()),
                    parts,
                }),
            }
        }

        if contents.is_empty() {
            return Err(Error::malformed(NO_TURN_CONTENT));
        }

        let generation_config = (request.temperature.is_some() || request.max_tokens.is_some())
            .then(|| GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            });

        Ok(GenerateContentRequest {
            system_instruction: (!system_parts.is_empty()).then(|| Content {
                role: None,
                parts: system_parts,
            }),
            contents,
            generation_config,
        })
    }

    async fn translate_parts(&self, message: &ChatMessage) -> Result<Vec<Part>> {
        let mut translated = Vec::new();
        match &message.content {
            None => {}
            Some(MessageContent::Text(text)) => {
                if !text.is_empty() {
                    translated.push(Part::Text { text: text.clone() });
                }
            }
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            translated.push(Part::Text { text: text.clone() })
                        }
                        ContentPart::ImageUrl { image_url } => {
                            translated.push(self.inline_image(&image_url.url).await?)
                        }
                    }
                }
            }
        }
        Ok(translated)
    }

    async fn inline_image(&self, url: &str) -> Result<Part> {
        let (data, mime_type) = if data_url::is_data_url(url) {
            decode_inline_image(url)?
        } else {
            tracing::debug!("Downloading image for Gemini from {}", url);
            let downloaded = self.http.download_image(url, self.max_image_bytes).await?;
            (downloaded.data, downloaded.mime_type)
        };

        Ok(Part::InlineData {
            inline_data: InlineData {
                mime_type,
                data: base64::engine::general_purpose::STANDARD.encode(data),
            },
        })
    }
}

fn reject_tools(request: &ChatCompletionRequest) -> Result<()> {
    if request.uses_tools() {
        return Err(Error::malformed(
            "tool calling is not supported by the Gemini provider",
        ));
    }
    Ok(())
}

/// Bytes and MIME type of a `data:` image; the sniffed type wins over the declared one.
fn decode_inline_image(url: &str) -> Result<(Vec<u8>, String)> {
    let decoded = data_url::parse_data_url(url)?;
    let mime_type = match mime::detect_image_mime(&decoded.data) {
        Some(sniffed) => sniffed.to_string(),
        None => decoded
            .declared_mime
            .map(|m| mime::normalize(&m))
            .filter(|m| mime::is_supported(m))
            .ok_or_else(|| {
                crate::ValidationError::UnsupportedMediaType(
                    "inline image is not a supported format".to_string(),
                )
            })?,
    };
    Ok((decoded.data, mime_type))
}

/// Map Gemini finish reasons onto the OpenAI vocabulary.
fn finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            "content_filter".to_string()
        }
        other => other.to_ascii_lowercase(),
    }
}

fn usage(metadata: &UsageMetadata) -> Usage {
    let total = if metadata.total_token_count > 0 {
        metadata.total_token_count
    } else {
        metadata.prompt_token_count + metadata.candidates_token_count
    };
    Usage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens: metadata.candidates_token_count,
        total_tokens: total,
    }
}

fn extract_text(response: &GenerateContentResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            Part::InlineData { .. } | Part::Other(_) => None,
        })
        .collect();
    Some(text)
}

fn to_chunk(response: &GenerateContentResponse) -> CompletionChunk {
    CompletionChunk {
        content: extract_text(response).filter(|t| !t.is_empty()),
        tool_calls: None,
        finish_reason: response
            .candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .map(finish_reason),
        usage: response.usage_metadata.as_ref().map(usage),
    }
}

fn parse_event(payload: &str) -> Result<CompletionChunk> {
    let response: GenerateContentResponse = serde_json::from_str(payload).map_err(|e| {
        tracing::error!("Failed to parse Gemini event: {}\nPayload: {}", e, payload);
        UpstreamError::Malformed {
            provider: PROVIDER,
            detail: e.to_string(),
        }
    })?;
    Ok(to_chunk(&response))
}

#[async_trait]
impl CompletionService for GeminiCompletionClient {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn model(&self) -> &str {
        self.http.model()
    }

    /// Same rejections `translate` would raise, minus remote downloads.
    fn check(&self, request: &ChatCompletionRequest) -> Result<()> {
        reject_tools(request)?;

        let mut has_turn_content = false;
        for message in request.messages.iter().filter(|m| !m.is_system()) {
            match &message.content {
                None => {}
                Some(MessageContent::Text(text)) => has_turn_content |= !text.is_empty(),
                Some(MessageContent::Parts(parts)) => {
                    has_turn_content |= !parts.is_empty();
                    for part in parts {
                        if let ContentPart::ImageUrl { image_url } = part {
                            if data_url::is_data_url(&image_url.url) {
                                decode_inline_image(&image_url.url)?;
                            }
                        }
                    }
                }
            }
        }

        if !has_turn_content {
            return Err(Error::malformed(NO_TURN_CONTENT));
        }
        Ok(())
    }

    async fn complete(&self, request: &ChatCompletionRequest) -> Result<CompletionResponse> {
        let body = self.translate(request).await?;
        let response = self.http.generate_content(&body).await?;

        if response.candidates.is_empty() {
            return Err(UpstreamError::Malformed {
                provider: PROVIDER,
                detail: "response has no candidates".to_string(),
            }
            .into());
        }

        let chunk = to_chunk(&response);
        Ok(CompletionResponse {
            id: response.response_id.clone(),
            model: response
                .model_version
                .clone()
                .or_else(|| Some(self.http.model().to_string())),
            content: chunk.content.unwrap_or_default(),
            tool_calls: None,
            finish_reason: chunk.finish_reason,
            usage: chunk.usage,
        })
    }

    async fn complete_stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream> {
        let body = self.translate(request).await?;
        let response = self.http.stream_generate_content(&body).await?;

        let chunks = sse::data_events(response.bytes_stream(), PROVIDER)
            .map(|event| event.and_then(|data| parse_event(&data)))
            .filter(|chunk| futures::future::ready(!matches!(chunk, Ok(c) if c.is_empty())));

        Ok(fuse_on_error(chunks.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "gemini-2.5-pro";
    const PNG_DATA_URL: &str = "data:image/png;base64,iVBORw0KGgo=";

    fn make_client(server: &MockServer) -> GeminiCompletionClient {
        make_client_with_timeout(server, Duration::from_secs(5))
    }

    fn make_client_with_timeout(server: &MockServer, timeout: Duration) -> GeminiCompletionClient {
        GeminiCompletionClient::new("test-key".to_string(), format!("models/{}", MODEL), timeout)
            .with_base_url(server.uri())
    }

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: String::new(),
            messages,
            stream: None,
            temperature: Some(0.5),
            max_tokens: Some(128),
            user: None,
            session_hint: None,
            extra_body: None,
            tools: None,
            tool_choice: None,
        }
    }

    #[tokio::test]
    async fn test_translate_maps_roles_and_system_instruction() {
        let server = MockServer::start().await;
        let client = make_client(&server);

        let translated = client
            .translate(&request(vec![
                ChatMessage::text("system", "Be brief."),
                ChatMessage::text("user", "Hi"),
                ChatMessage::text("user", "Still there?"),
                ChatMessage::text("assistant", "Yes."),
                ChatMessage::parts(
                    "user",
                    vec![
                        ContentPart::Text {
                            text: "Look".to_string(),
                        },
                        ContentPart::image(PNG_DATA_URL),
                    ],
                ),
            ]))
            .await
            .unwrap();

        let json = serde_json::to_value(&translated).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "systemInstruction": { "parts": [{ "text": "Be brief." }] },
                "contents": [
                    { "role": "user", "parts": [{ "text": "Hi" }, { "text": "Still there?" }] },
                    { "role": "model", "parts": [{ "text": "Yes." }] },
                    { "role": "user", "parts": [
                        { "text": "Look" },
                        { "inlineData": { "mimeType": "image/png", "data": "iVBORw0KGgo=" } }
                    ]}
                ],
                "generationConfig": { "temperature": 0.5, "maxOutputTokens": 128 }
            })
        );
    }

    #[tokio::test]
    async fn test_translate_rejects_system_only_request() {
        let server = MockServer::start().await;
        let client = make_client(&server);

        let err = client
            .translate(&request(vec![ChatMessage::text("system", "Be brief.")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_check_matches_translate_rejections() {
        let server = MockServer::start().await;
        let client = make_client(&server);

        let system_only = request(vec![ChatMessage::text("system", "Be brief.")]);
        assert!(matches!(client.check(&system_only), Err(Error::Validation(_))));

        let bad_image = request(vec![ChatMessage::parts(
            "user",
            vec![ContentPart::image("data:text/plain;base64,aGVsbG8=")],
        )]);
        assert!(matches!(client.check(&bad_image), Err(Error::Validation(_))));

        let with_tools = ChatCompletionRequest {
            tools: Some(serde_json::json!([{ "type": "function" }])),
            ..request(vec![ChatMessage::text("user", "Hi")])
        };
        let err = client.check(&with_tools).unwrap_err();
        assert!(err.to_string().contains("tool calling"));
        assert!(client.translate(&with_tools).await.is_err());

        // Remote images are only fetched once the turn is forwarded.
        let remote = request(vec![ChatMessage::parts(
            "user",
            vec![ContentPart::image(format!("{}/cat.png", server.uri()))],
        )]);
        client.check(&remote).unwrap();
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_image_is_downloaded_and_inlined() {
        let server = MockServer::start().await;
        let png = data_url::parse_data_url(PNG_DATA_URL).unwrap().data;

        Mock::given(method("GET"))
            .and(path("/cat.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(png, "image/png"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let part = client
            .inline_image(&format!("{}/cat.png", server.uri()))
            .await
            .unwrap();

        assert_eq!(
            part,
            Part::InlineData {
                inline_data: InlineData {
                    mime_type: "image/png".to_string(),
                    data: "iVBORw0KGgo=".to_string(),
                }
            }
        );
    }

    #[tokio::test]
    async fn test_remote_image_over_limit_is_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/big.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 4096], "image/png"))
            .mount(&server)
            .await;

        let client = make_client(&server).with_max_image_bytes(1024);
        let err = client
            .inline_image(&format!("{}/big.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(crate::ValidationError::PayloadTooLarge { limit: 1024, .. })
        ));
    }

    #[tokio::test]
    async fn test_complete_parses_response() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "contents": [{ "role": "user", "parts": [{ "text": "Hi" }] }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": "Hello " }, { "text": "there" }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5 },
                "modelVersion": "gemini-2.5-pro-001"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let response = client
            .complete(&request(vec![ChatMessage::text("user", "Hi")]))
            .await
            .unwrap();

        assert_eq!(response.content, "Hello there");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.model.as_deref(), Some("gemini-2.5-pro-001"));
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(5));
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_candidates() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "candidates": [] })),
            )
            .mount(&server)
            .await;

        let client = make_client(&server);
        let err = client
            .complete(&request(vec![ChatMessage::text("user", "Hi")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Upstream(UpstreamError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_api_error_returns_upstream_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = make_client(&server);
        let err = client
            .complete(&request(vec![ChatMessage::text("user", "Hi")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Upstream(UpstreamError::Status { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_complete_rejects_malformed_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let client = make_client(&server);
        let err = client
            .complete(&request(vec![ChatMessage::text("user", "Hi")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Upstream(UpstreamError::Malformed { provider: "Gemini", .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(serde_json::json!({ "candidates": [] })),
            )
            .mount(&server)
            .await;

        let client = make_client_with_timeout(&server, Duration::from_millis(50));
        let err = client
            .complete(&request(vec![ChatMessage::text("user", "Hi")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Upstream(UpstreamError::Timeout { provider: "Gemini" })
        ));
    }

    #[tokio::test]
    async fn test_complete_stream_reports_malformed_event() {
        let server = MockServer::start().await;

        let body = [
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"ok"}]}}]}"#,
            "not json",
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"never"}]}}]}"#,
        ]
        .iter()
        .map(|e| format!("data: {}\r\n\r\n", e))
        .collect::<String>();

        Mock::given(method("POST"))
            .and(path(format!(
                "/v1beta/models/{}:streamGenerateContent",
                MODEL
            )))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = make_client(&server);
        let items: Vec<_> = client
            .complete_stream(&request(vec![ChatMessage::text("user", "Hi")]))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &CompletionChunk::text("ok"));
        assert!(matches!(
            items[1],
            Err(Error::Upstream(UpstreamError::Malformed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_complete_stream_maps_events() {
        let server = MockServer::start().await;

        let body = [
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":2}}"#,
        ]
        .iter()
        .map(|e| format!("data: {}\r\n\r\n", e))
        .collect::<String>();

        Mock::given(method("POST"))
            .and(path(format!(
                "/v1beta/models/{}:streamGenerateContent",
                MODEL
            )))
            .and(wiremock::matchers::query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let chunks: Vec<CompletionChunk> = client
            .complete_stream(&request(vec![ChatMessage::text("user", "Hi")]))
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(
            chunks,
            vec![
                CompletionChunk::text("Hel"),
                CompletionChunk {
                    content: Some("lo".to_string()),
                    tool_calls: None,
                    finish_reason: Some("length".to_string()),
                    usage: Some(Usage {
                        prompt_tokens: 1,
                        completion_tokens: 2,
                        total_tokens: 3
                    }),
                },
            ]
        );
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(finish_reason("STOP"), "stop");
        assert_eq!(finish_reason("MAX_TOKENS"), "length");
        assert_eq!(finish_reason("SAFETY"), "content_filter");
        assert_eq!(finish_reason("OTHER"), "other");
    }
}
