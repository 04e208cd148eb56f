//! Widget persistence backends
//!
//! Two implementations behind one trait: the flat local cache (per device)
//! and the cloud document store (shared between devices). The backend is
//! chosen once at startup; the store falls back to local on live failures.

pub mod cloud;
pub mod document_store;
pub mod local;
pub mod local_cache;

pub use cloud::CloudBackend;
pub use document_store::{DocumentStore, HttpDocumentStore};
pub use local::LocalBackend;
pub use local_cache::LocalCache;

use crate::config::Config;
use crate::data::{UiSettings, Widget};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Persisted widgets, keyed by id
pub type Collection = BTreeMap<String, Widget>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("storage unreachable: {0}")]
    Transport(String),
    #[error("storage rejected credentials: {0}")]
    Auth(String),
    #[error("bad stored data: {0}")]
    Data(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    pub fn is_auth(&self) -> bool {
        matches!(self, BackendError::Auth(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Cloud => f.write_str("cloud"),
        }
    }
}

/// Storage operations the widget store needs
#[async_trait]
pub trait WidgetBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether `load` may return edits made on other devices
    fn is_shared(&self) -> bool {
        false
    }

    /// Full collection; an absent collection is empty, not an error
    async fn load(&self) -> Result<Collection, BackendError>;

    /// Write one widget record in full (fields absent on `widget` are removed)
    async fn upsert(&self, widget: &Widget) -> Result<(), BackendError>;

    async fn remove(&self, id: &str) -> Result<(), BackendError>;

    /// Replace the stored collection
    ///
    /// With `explicit == false` an empty `widgets` never replaces a non-empty
    /// stored collection; the call is skipped with a warning.
    async fn save_collection(&self, widgets: &Collection, explicit: bool) -> Result<(), BackendError>;

    async fn load_ui(&self) -> Result<UiSettings, BackendError>;

    async fn save_ui(&self, ui: &UiSettings) -> Result<(), BackendError>;
}

/// The startup decision: the active backend plus the local tier to fall back to
pub struct BackendSelection {
    pub active: Arc<dyn WidgetBackend>,
    pub fallback: Option<Arc<dyn WidgetBackend>>,
    /// Why the cloud was not used, for a startup warning
    pub cloud_error: Option<BackendError>,
}

impl BackendSelection {
    pub fn local(local: Arc<LocalBackend>) -> Self {
        Self {
            active: local,
            fallback: None,
            cloud_error: None,
        }
    }
}

/// Pick cloud when it is enabled and passes sign-in and a read, otherwise local
pub async fn select_backend(config: &Config, local: Arc<LocalBackend>) -> BackendSelection {
    if !config.cloud.enabled {
        tracing::info!("Cloud storage disabled, using local cache");
        return BackendSelection::local(local);
    }

    let docs = match HttpDocumentStore::new(
        &config.cloud.endpoint,
        config.cloud.api_key.as_deref(),
        Duration::from_secs(config.hub.request_timeout_secs),
    ) {
        Ok(docs) => docs,
        Err(e) => {
            tracing::warn!("Cloud storage unusable: {}", e);
            let mut selection = BackendSelection::local(local);
            selection.cloud_error = Some(e);
            return selection;
        }
    };

    select_with_store(Arc::new(docs), local).await
}

/// Capability check against any document store
pub async fn select_with_store(
    docs: Arc<dyn DocumentStore>,
    local: Arc<LocalBackend>,
) -> BackendSelection {
    match CloudBackend::init(docs, local.as_ref()).await {
        Ok(cloud) => {
            tracing::info!("Using cloud storage");
            BackendSelection {
                active: Arc::new(cloud),
                fallback: Some(local),
                cloud_error: None,
            }
        }
        Err(e) => {
            if e.is_auth() {
                tracing::warn!("Cloud storage rejected credentials, staying local: {}", e);
            } else {
                tracing::warn!("Cloud storage unavailable, using local cache: {}", e);
            }
            let mut selection = BackendSelection::local(local);
            selection.cloud_error = Some(e);
            selection
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::document_store::MemoryDocumentStore;

    #[tokio::test]
    async fn test_disabled_cloud_selects_local() {
        let config = Config::default();
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let selection = select_backend(&config, local).await;
        assert_eq!(selection.active.kind(), BackendKind::Local);
        assert!(selection.fallback.is_none());
        assert!(selection.cloud_error.is_none());
    }

    #[tokio::test]
    async fn test_reachable_store_selects_cloud() {
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let selection = select_with_store(Arc::new(MemoryDocumentStore::new()), local).await;
        assert_eq!(selection.active.kind(), BackendKind::Cloud);
        assert_eq!(selection.fallback.map(|b| b.kind()), Some(BackendKind::Local));
    }

    #[tokio::test]
    async fn test_auth_failure_selects_local() {
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let docs = MemoryDocumentStore::new();
        docs.reject_sign_in(true);
        let selection = select_with_store(Arc::new(docs), local).await;
        assert_eq!(selection.active.kind(), BackendKind::Local);
        assert!(selection.cloud_error.unwrap().is_auth());
    }
}
