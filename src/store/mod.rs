use crate::config::GatewayConfig;
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Shared configuration snapshot, swapped atomically on reload.
///
/// Handlers take a snapshot once per request so a mid-flight reload
/// never mixes old and new policy for the same request.
#[derive(Clone)]
pub struct PolicyStore {
    inner: Arc<RwLock<Arc<GatewayConfig>>>,
}

impl PolicyStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Cheap clone of the current configuration snapshot
    pub async fn snapshot(&self) -> Arc<GatewayConfig> {
        self.inner.read().await.clone()
    }

    /// Validate and swap in a new configuration
    pub async fn replace(&self, new_config: GatewayConfig) -> Result<()> {
        new_config.validate()?;
        let mut guard = self.inner.write().await;
        *guard = Arc::new(new_config);
        info!("Configuration snapshot replaced");
        Ok(())
    }
}
