// Configuration hot reload module
// Handles SIGHUP signal to reload configuration without downtime

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::context::ServiceContext;
use crate::error::ServiceError;

/// ReloadManager handles configuration reload via SIGHUP signal
pub struct ReloadManager {
    config_path: PathBuf,
    reload_requested: Arc<AtomicBool>,
}

impl ReloadManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            reload_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the SIGHUP handler that flags a pending reload.
    #[cfg(unix)]
    pub fn register_signal_handler(&self) -> Result<(), ServiceError> {
        use signal_hook::consts::SIGHUP;
        use signal_hook::flag;

        flag::register(SIGHUP, Arc::clone(&self.reload_requested)).map_err(|e| {
            ServiceError::Configuration(format!("failed to register SIGHUP handler: {}", e))
        })?;
        Ok(())
    }

    pub fn is_reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::Relaxed)
    }

    pub fn clear_reload_request(&self) {
        self.reload_requested.store(false, Ordering::Relaxed);
    }

    /// Load and validate the file. The caller decides when to swap.
    pub fn reload_config(&self) -> Result<Config, ServiceError> {
        Config::from_file(&self.config_path)
    }

    /// Load, validate, and atomically swap the context's snapshot. On
    /// failure the previous configuration stays in effect and in-flight
    /// requests keep their snapshots either way.
    pub fn apply(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let config = self.reload_config()?;
        ctx.reload(config)?;
        tracing::info!(config_file = %self.config_path.display(), "configuration reloaded");
        Ok(())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID_CONFIG: &str = r#"
video:
  origins:
    - name: videos
      matcher: "^/videos/(.*)$"
      sources:
        - {type: r2, path: "${1}", bucketBinding: VIDEOS_BUCKET}
"#;

    fn config_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reload_manager_can_be_created() {
        let file = config_file(VALID_CONFIG);
        let manager = ReloadManager::new(file.path().to_path_buf());
        assert_eq!(manager.config_path(), &file.path().to_path_buf());
    }

    #[test]
    #[cfg(unix)]
    fn test_can_register_sighup_handler() {
        let file = config_file(VALID_CONFIG);
        let manager = ReloadManager::new(file.path().to_path_buf());
        assert!(manager.register_signal_handler().is_ok());
    }

    #[test]
    fn test_reload_flag_starts_false_and_clears() {
        let file = config_file(VALID_CONFIG);
        let manager = ReloadManager::new(file.path().to_path_buf());
        assert!(!manager.is_reload_requested());

        manager.reload_requested.store(true, Ordering::Relaxed);
        assert!(manager.is_reload_requested());
        manager.clear_reload_request();
        assert!(!manager.is_reload_requested());
    }

    #[test]
    fn test_reload_config_validates_before_applying() {
        let file = config_file(VALID_CONFIG);
        let manager = ReloadManager::new(file.path().to_path_buf());
        let config = manager.reload_config().expect("valid config should load");
        assert_eq!(config.origins()[0].name, "videos");
    }

    #[test]
    fn test_reload_config_rejects_invalid_config() {
        let file = config_file("video: {}\n");
        let manager = ReloadManager::new(file.path().to_path_buf());
        assert!(manager.reload_config().is_err());
    }

    #[tokio::test]
    async fn test_apply_keeps_old_snapshot_on_failure() {
        let valid = config_file(VALID_CONFIG);
        let ctx = ServiceContext::with_memory_bindings(
            Config::from_file(valid.path()).unwrap(),
        )
        .unwrap();

        let broken = config_file("video: {}\n");
        let manager = ReloadManager::new(broken.path().to_path_buf());
        assert!(manager.apply(&ctx).is_err());
        // The previous origin table is still being served.
        assert!(ctx.resolver().resolve("/videos/a.mp4", |_| true).is_ok());
    }
}
