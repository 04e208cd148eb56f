//! UI settings - global view state shared across devices
//!
//! Labels/sidebar toggles, viewport scroll, zoom and pan. Stored as one
//! singleton document in the cloud, or as loose keys in the local cache.

use serde::{Deserialize, Serialize};

/// Viewport point (also used for pan offsets)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
}

/// Global UI settings; every field is optional so partial updates merge cleanly
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidebar_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_position: Option<ScrollPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<ScrollPosition>,
}

impl UiSettings {
    /// Overlay set fields from `update`; returns true if anything changed
    pub fn merge(&mut self, update: &UiSettings) -> bool {
        let before = self.clone();
        if update.labels_visible.is_some() {
            self.labels_visible = update.labels_visible;
        }
        if update.sidebar_visible.is_some() {
            self.sidebar_visible = update.sidebar_visible;
        }
        if update.scroll_position.is_some() {
            self.scroll_position = update.scroll_position;
        }
        if let Some(scale) = update.scale.filter(|s| s.is_finite() && *s > 0.0) {
            self.scale = Some(scale);
        }
        if update.pan.is_some() {
            self.pan = update.pan;
        }
        *self != before
    }

    /// Labels default to visible
    pub fn labels_visible(&self) -> bool {
        self.labels_visible.unwrap_or(true)
    }

    pub fn sidebar_visible(&self) -> bool {
        self.sidebar_visible.unwrap_or(true)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
