use super::{ImageContext, SessionStore};
use crate::blob::BlobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounds the store's growth and frees the storage behind evicted contexts.
pub struct SessionLifecycle {
    store: Arc<SessionStore>,
    blobs: Arc<dyn BlobStore>,
    max_age: Duration,
}

impl SessionLifecycle {
    pub fn new(store: Arc<SessionStore>, blobs: Arc<dyn BlobStore>, max_age: Duration) -> Self {
        Self {
            store,
            blobs,
            max_age,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Handle the platform's "session ended" signal. Returns whether anything was evicted.
    pub async fn end_session(&self, key: &str) -> bool {
        match self.store.evict(key) {
            Some(context) => {
                info!("Session {} ended, evicting image context", context.session_key);
                self.release(context).await;
                true
            }
            None => {
                debug!("Session {} ended with no image context", key);
                false
            }
        }
    }

    /// Evict everything idle for longer than the configured max age.
    pub async fn sweep(&self) -> usize {
        let evicted = self.store.evict_expired(self.max_age);
        let count = evicted.len();
        for context in evicted {
            self.release(context).await;
        }
        if count > 0 {
            info!("Swept {} expired image context(s)", count);
        }
        count
    }

    /// Delete the blob owned by a context that has left the store.
    pub async fn release(&self, context: ImageContext) {
        if let Some(key) = context.blob_key {
            if let Err(e) = self.blobs.remove(&key).await {
                warn!("Failed to release blob {}: {}", key, e);
            }
        }
    }

    /// Release the blob when the returned guard is dropped.
    ///
    /// Used for one-shot contexts whose blob may still be fetched by the
    /// provider while the turn is in flight.
    pub fn release_on_drop(&self, context: &ImageContext) -> BlobReleaseGuard {
        BlobReleaseGuard {
            blobs: Arc::clone(&self.blobs),
            key: context.blob_key.clone(),
        }
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}

pub struct BlobReleaseGuard {
    blobs: Arc<dyn BlobStore>,
    key: Option<String>,
}

impl Drop for BlobReleaseGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let blobs = Arc::clone(&self.blobs);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = blobs.remove(&key).await {
                        warn!("Failed to release blob {}: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release blob {}", key),
        }
    }
}
