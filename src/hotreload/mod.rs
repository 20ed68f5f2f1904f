use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::store::PolicyStore;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Watches the configuration file and swaps validated snapshots into
/// the policy store. A reload that fails to parse or validate leaves
/// the running configuration untouched.
pub struct HotReloadService {
    config_path: PathBuf,
    store: PolicyStore,
    debounce: Duration,
}

impl HotReloadService {
    pub fn new(config_path: PathBuf, store: PolicyStore, debounce_ms: u64) -> Self {
        Self {
            config_path,
            store,
            debounce: Duration::from_millis(debounce_ms),
        }
    }

    pub fn start(self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                    ) {
                        let _ = tx.blocking_send(event);
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::Internal(format!("Failed to watch config file: {}", e)))?;

        info!(
            path = %self.config_path.display(),
            debounce_ms = self.debounce.as_millis() as u64,
            "Hot reload watcher started"
        );

        tokio::spawn(async move {
            let mut last_reload: Option<Instant> = None;

            while let Some(event) = rx.recv().await {
                debug!(?event, "Config file change detected");

                let now = Instant::now();
                if last_reload
                    .map(|t| now.duration_since(t) < self.debounce)
                    .unwrap_or(false)
                {
                    debug!("Ignoring event inside debounce window");
                    continue;
                }
                last_reload = Some(now);

                match self.reload().await {
                    Ok(()) => info!("Configuration reloaded"),
                    Err(e) => error!(error = %e, "Reload failed, keeping current configuration"),
                }
            }

            drop(watcher);
        });

        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let new_config = GatewayConfig::from_file(&self.config_path)?;
        self.store.replace(new_config).await
    }
}
