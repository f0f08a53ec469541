//! Named pool of object backends, fixed at startup.

use super::{
    backend::{Backend, ObjectBackend},
    error::{StorageError, StorageResult},
    memory_backend::MemoryBackend,
    s3_backend::S3Backend,
};
use crate::{config::AppConfig, models::file_item::ServerKey};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info};

#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<ServerKey, Backend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(
        mut self,
        server: ServerKey,
        host: impl Into<String>,
        inner: Arc<dyn ObjectBackend>,
        timeout: Duration,
    ) -> Self {
        let backend = Backend::new(server, host, inner, timeout);
        debug!(%server, host = backend.host(), ?timeout, "backend registered");
        self.backends.insert(server, backend);
        self
    }

    /// Build every configured backend. The default server must be among them.
    pub fn from_config(cfg: &AppConfig) -> StorageResult<Self> {
        let mut registry = Self::new();

        for server in ServerKey::ALL {
            let settings = cfg.backends.get(&server);
            if cfg.memory_backends {
                let host = settings
                    .map(|s| s.host.clone())
                    .unwrap_or_else(|| format!("{}.memory.local", server.as_str().to_lowercase()));
                info!(%server, %host, "registering in-memory backend");
                registry = registry.with_backend(
                    server,
                    host,
                    Arc::new(MemoryBackend::new()),
                    cfg.backend_timeout,
                );
            } else if let Some(settings) = settings {
                info!(%server, host = %settings.host, "registering S3 backend");
                registry = registry.with_backend(
                    server,
                    settings.host.clone(),
                    Arc::new(S3Backend::new(settings)),
                    cfg.backend_timeout,
                );
            }
        }

        registry.resolve(cfg.default_server)?;
        Ok(registry)
    }

    pub fn resolve(&self, server: ServerKey) -> StorageResult<&Backend> {
        self.backends.get(&server).ok_or_else(|| {
            StorageError::Configuration(format!("no backend configured for server `{}`", server))
        })
    }
}
