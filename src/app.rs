//! Composition root wiring configuration into the running services.

use crate::ai::{CompletionService, GeminiCompletionClient, OpenAiCompletionClient};
use crate::blob::{BlobStore, LocalBlobStore, S3BlobStore};
use crate::image::{ImageIngestor, IngestLimits};
use crate::models::{AiProvider, BlobBackend, Config};
use crate::proxy::CompletionProxy;
use crate::session::{SessionLifecycle, SessionStore};
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared handles for the image broker and the completion proxy.
pub struct App {
    config: Config,
    lifecycle: Arc<SessionLifecycle>,
    ingestor: ImageIngestor,
    proxy: CompletionProxy,
}

/// Injectable service bundle used to construct [`App`] in tests/harnesses.
pub struct AppServices {
    pub completion: Arc<dyn CompletionService>,
    pub blobs: Arc<dyn BlobStore>,
}

impl App {
    /// Build an app from concrete service dependencies.
    ///
    /// This is primarily useful for integration tests and local harnesses that
    /// need to inject mocks.
    pub fn with_services(services: AppServices, config: Config) -> Self {
        let store = Arc::new(SessionStore::new(config.injection_policy));
        let lifecycle = Arc::new(SessionLifecycle::new(
            store,
            services.blobs,
            config.session_max_age,
        ));

        let ingestor = ImageIngestor::new(
            Arc::clone(&lifecycle),
            IngestLimits {
                max_bytes: config.max_image_bytes,
                strip_metadata: config.strip_metadata,
            },
        );

        let proxy = CompletionProxy::new(
            services.completion,
            Arc::clone(&lifecycle),
            config.image_reference,
            config.stream_idle_timeout,
        );

        Self {
            config,
            lifecycle,
            ingestor,
            proxy,
        }
    }

    fn build_completion_service(
        config: &Config,
        http_client: reqwest::Client,
    ) -> Arc<dyn CompletionService> {
        let api_key = config.api_key.clone();
        let model = config.model.clone();

        match config.provider {
            AiProvider::OpenAi => {
                info!("Completion provider: OpenAI (model: {})", model);
                let client = OpenAiCompletionClient::new_with_client(
                    api_key,
                    model,
                    config.upstream_timeout,
                    http_client,
                );
                match &config.base_url {
                    Some(base_url) => Arc::new(client.with_base_url(base_url.clone())),
                    None => Arc::new(client),
                }
            }
            AiProvider::Gemini => {
                info!("Completion provider: Gemini (model: {})", model);
                let client = GeminiCompletionClient::new_with_client(
                    api_key,
                    model,
                    config.upstream_timeout,
                    http_client,
                )
                .with_max_image_bytes(config.max_image_bytes);
                match &config.base_url {
                    Some(base_url) => Arc::new(client.with_base_url(base_url.clone())),
                    None => Arc::new(client),
                }
            }
        }
    }

    async fn build_blob_store(config: &Config) -> Result<Arc<dyn BlobStore>> {
        Ok(match &config.blob_backend {
            BlobBackend::Local { dir } => {
                Arc::new(LocalBlobStore::new(dir, config.public_base_url.clone()).await?)
            }
            BlobBackend::S3(settings) => Arc::new(S3BlobStore::new(settings.clone()).await?),
        })
    }

    /// Construct an app from a loaded configuration.
    pub async fn from_config(config: Config) -> Result<Self> {
        // Reuse one HTTP connection pool for every upstream call.
        let http_client = reqwest::Client::new();

        let services = AppServices {
            completion: Self::build_completion_service(&config, http_client),
            blobs: Self::build_blob_store(&config).await?,
        };

        Ok(Self::with_services(services, config))
    }

    /// Construct an app from environment configuration (`Config::from_env`).
    pub async fn new() -> Result<Self> {
        Self::from_config(Config::from_env()?).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        self.lifecycle.store()
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        self.lifecycle.blobs()
    }

    pub fn lifecycle(&self) -> &Arc<SessionLifecycle> {
        &self.lifecycle
    }

    pub fn ingestor(&self) -> &ImageIngestor {
        &self.ingestor
    }

    pub fn proxy(&self) -> &CompletionProxy {
        &self.proxy
    }

    /// Start the periodic expiry sweep; it stops when `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(
            "Sweeping sessions idle for {:?} every {:?}",
            self.config.session_max_age, self.config.sweep_interval
        );
        Arc::clone(&self.lifecycle).spawn_sweeper(self.config.sweep_interval, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockCompletionClient;
    use crate::blob::MockBlobStore;
    use crate::models::InjectionPolicy;

    fn test_config() -> Config {
        Config::from_lookup(|key| match key {
            "OPENAI_API_KEY" => Some("test-key".to_string()),
            "INJECTION_POLICY" => Some("delete".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_with_services_applies_config() {
        let app = App::with_services(
            AppServices {
                completion: Arc::new(MockCompletionClient::new()),
                blobs: Arc::new(MockBlobStore::new()),
            },
            test_config(),
        );

        assert_eq!(app.store().policy(), InjectionPolicy::DeleteAfterUse);
        assert_eq!(app.ingestor().max_bytes(), 10 * 1024 * 1024);
        assert_eq!(app.proxy().service().model(), "mock-model");
    }

    #[tokio::test]
    async fn test_from_config_selects_provider() {
        let dir = tempfile::TempDir::new().unwrap();
        let dir_path = dir.path().to_string_lossy().to_string();
        let config = Config::from_lookup(|key| match key {
            "LLM_PROVIDER" => Some("gemini".to_string()),
            "GEMINI_API_KEY" => Some("g-key".to_string()),
            "BLOB_DIR" => Some(dir_path.clone()),
            _ => None,
        })
        .unwrap();

        let app = App::from_config(config).await.unwrap();
        assert_eq!(app.proxy().service().provider(), "Gemini");
        assert_eq!(app.proxy().service().model(), "gemini-2.5-pro");
    }

    #[tokio::test]
    async fn test_sweeper_is_cancellable() {
        let app = App::with_services(
            AppServices {
                completion: Arc::new(MockCompletionClient::new()),
                blobs: Arc::new(MockBlobStore::new()),
            },
            test_config(),
        );
        let shutdown = CancellationToken::new();
        let handle = app.spawn_sweeper(shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();
    }
}
