//! Cloud backend: one document per widget plus a UI-settings singleton

use super::document_store::DocumentStore;
use super::local::LocalBackend;
use super::{BackendError, BackendKind, Collection, WidgetBackend};
use crate::data::{UiSettings, Widget};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const WIDGETS_COLLECTION: &str = "widgets";
pub const UI_COLLECTION: &str = "ui";
pub const UI_DOCUMENT: &str = "settings";

pub struct CloudBackend {
    docs: Arc<dyn DocumentStore>,
}

impl CloudBackend {
    /// Sign in, verify the store answers, and seed it from the local cache
    /// when it has never been written
    pub async fn init(docs: Arc<dyn DocumentStore>, local: &LocalBackend) -> Result<Self, BackendError> {
        docs.sign_in().await?;
        let backend = Self { docs };

        let existing = backend.docs.list(WIDGETS_COLLECTION).await?;
        if existing.is_empty() {
            backend.migrate_widgets(local).await?;
        } else {
            debug!("Cloud already holds {} widget documents", existing.len());
        }

        if backend.docs.get(UI_COLLECTION, UI_DOCUMENT).await?.is_none() {
            backend.migrate_ui(local).await?;
        }

        Ok(backend)
    }

    async fn migrate_widgets(&self, local: &LocalBackend) -> Result<(), BackendError> {
        let widgets = match local.load().await {
            Ok(widgets) => widgets,
            Err(e) => {
                warn!("Could not read local cache for migration: {}", e);
                return Ok(());
            }
        };
        if widgets.is_empty() {
            return Ok(());
        }
        for widget in widgets.values() {
            self.upsert(widget).await?;
        }
        info!("Migrated {} widgets from local cache to cloud", widgets.len());
        Ok(())
    }

    async fn migrate_ui(&self, local: &LocalBackend) -> Result<(), BackendError> {
        let ui = local.load_ui().await.unwrap_or_default();
        if ui.is_empty() {
            return Ok(());
        }
        self.save_ui(&ui).await?;
        info!("Migrated UI settings from local cache to cloud");
        Ok(())
    }

    fn decode_widget(id: &str, data: Value) -> Option<Widget> {
        match serde_json::from_value::<Widget>(data) {
            Ok(mut widget) => {
                // The document id is authoritative
                widget.id = id.to_string();
                Some(widget)
            }
            Err(e) => {
                warn!("Skipping unreadable widget document {}: {}", id, e);
                None
            }
        }
    }
}

#[async_trait]
impl WidgetBackend for CloudBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn load(&self) -> Result<Collection, BackendError> {
        let docs = self.docs.list(WIDGETS_COLLECTION).await?;
        let collection: Collection = docs
            .into_iter()
            .filter_map(|(id, data)| Self::decode_widget(&id, data).map(|w| (id, w)))
            .collect();
        debug!("Loaded {} widgets from cloud", collection.len());
        Ok(collection)
    }

    async fn upsert(&self, widget: &Widget) -> Result<(), BackendError> {
        let data = serde_json::to_value(widget).map_err(|e| BackendError::Data(e.to_string()))?;
        self.docs.put(WIDGETS_COLLECTION, &widget.id, &data).await
    }

    async fn remove(&self, id: &str) -> Result<(), BackendError> {
        self.docs.delete(WIDGETS_COLLECTION, id).await
    }

    async fn save_collection(&self, widgets: &Collection, explicit: bool) -> Result<(), BackendError> {
        let stored = self.docs.list(WIDGETS_COLLECTION).await?;
        if widgets.is_empty() && !explicit && !stored.is_empty() {
            warn!("Refusing to overwrite cloud layout with an empty collection");
            return Ok(());
        }

        for widget in widgets.values() {
            self.upsert(widget).await?;
        }
        for (id, _) in stored {
            if !widgets.contains_key(&id) {
                self.docs.delete(WIDGETS_COLLECTION, &id).await?;
            }
        }
        info!("Saved {} widgets to cloud", widgets.len());
        Ok(())
    }

    async fn load_ui(&self) -> Result<UiSettings, BackendError> {
        match self.docs.get(UI_COLLECTION, UI_DOCUMENT).await? {
            Some(data) => serde_json::from_value(data).or_else(|e| {
                warn!("Ignoring unreadable UI settings document: {}", e);
                Ok(UiSettings::default())
            }),
            None => Ok(UiSettings::default()),
        }
    }

    async fn save_ui(&self, ui: &UiSettings) -> Result<(), BackendError> {
        // Merge over the stored document so partial settings don't erase the rest
        let mut merged = self.load_ui().await?;
        merged.merge(ui);
        let data = serde_json::to_value(&merged).map_err(|e| BackendError::Data(e.to_string()))?;
        self.docs.put(UI_COLLECTION, UI_DOCUMENT, &data).await
    }
}
