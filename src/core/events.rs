//! Surface protocol - what the diagram surface sends and what it is told
//!
//! The surface is external: it speaks JSON lines over stdin/stdout. Inbound
//! lines decode into `SurfaceEvent`, outbound render updates are
//! `RenderUpdate`. Both are tagged on `"type"`.

use crate::catalog::EntityData;
use crate::data::{Position, ScrollPosition, Size, UiSettings, Widget, WidgetPatch};
use crate::icons;
use crate::notify::Toast;
use crate::persistence::BackendKind;
use serde::{Deserialize, Serialize};

/// Events emitted by the diagram surface
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SurfaceEvent {
    /// Entity dragged from the palette onto the canvas
    Dropped {
        #[serde(alias = "id")]
        entity_id: String,
        x: f64,
        y: f64,
        #[serde(default)]
        width: Option<f64>,
        #[serde(default)]
        height: Option<f64>,
    },
    /// A palette copy's synthetic key now maps to a real entity
    KeyResolved { synthetic: String, entity_id: String },
    /// Node moved (fires continuously while dragging)
    Moved { id: String, x: f64, y: f64 },
    /// Node resized (fires continuously while resizing)
    Resized { id: String, width: f64, height: f64 },
    /// Drag or resize released
    GestureEnd { id: String },
    Removed { id: String },
    Tap { id: String },
    Hold { id: String },
    /// Properties dialog saved
    Edit {
        id: String,
        #[serde(default)]
        patch: WidgetPatch,
    },
    /// UI settings toggled
    Ui { settings: UiSettings },
    /// Viewport scrolled
    Scroll { x: f64, y: f64 },
    /// Re-read entity states now
    Refresh,
    /// Re-send the full layout
    Snapshot,
}

impl SurfaceEvent {
    /// Decode one protocol line
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Create a moved event
    pub fn moved(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self::Moved { id: id.into(), x, y }
    }

    /// Create a resized event
    pub fn resized(id: impl Into<String>, width: f64, height: f64) -> Self {
        Self::Resized {
            id: id.into(),
            width,
            height,
        }
    }

    /// Create a gesture end event
    pub fn gesture_end(id: impl Into<String>) -> Self {
        Self::GestureEnd { id: id.into() }
    }

    /// Create a dropped event without an explicit size
    pub fn dropped(entity_id: impl Into<String>, x: f64, y: f64) -> Self {
        Self::Dropped {
            entity_id: entity_id.into(),
            x,
            y,
            width: None,
            height: None,
        }
    }

    /// Widget id the event targets, if any
    pub fn widget_id(&self) -> Option<&str> {
        match self {
            Self::Dropped { entity_id, .. } => Some(entity_id),
            Self::KeyResolved { synthetic, .. } => Some(synthetic),
            Self::Moved { id, .. }
            | Self::Resized { id, .. }
            | Self::GestureEnd { id }
            | Self::Removed { id }
            | Self::Tap { id }
            | Self::Hold { id }
            | Self::Edit { id, .. } => Some(id),
            Self::Ui { .. } | Self::Scroll { .. } | Self::Refresh | Self::Snapshot => None,
        }
    }
}

/// Everything the surface needs to draw one widget
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub size: Size,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub icon: String,
    pub color: String,
    /// Entity missing from the hub
    pub unknown: bool,
}

impl WidgetView {
    pub fn build(
        widget: &Widget,
        entity: Option<&EntityData>,
        ui: &UiSettings,
        size: Size,
        unknown: bool,
    ) -> Self {
        let friendly = entity.map_or(widget.id.as_str(), |e| e.friendly_name.as_str());
        let state = entity.map(|e| e.state.as_str());

        let icon = widget
            .icon
            .as_deref()
            .and_then(icons::normalize_icon)
            .or_else(|| entity.map(|e| e.icon.clone()))
            .unwrap_or_else(|| {
                let domain = widget.id.split('.').next().unwrap_or_default();
                icons::default_icon(domain, None).to_string()
            });

        let color = if unknown {
            icons::icon_color(Some("unknown"), None, None)
        } else {
            icons::icon_color(
                state,
                widget.icon_color_on.as_deref(),
                widget.icon_color_off.as_deref(),
            )
        };

        Self {
            id: widget.id.clone(),
            position: widget.position,
            size,
            label: widget
                .display_label(friendly, ui.labels_visible())
                .map(str::to_string),
            value: widget.format_value(state.unwrap_or("unknown")),
            icon,
            color: color.to_string(),
            unknown,
        }
    }
}

/// Updates written back to the surface
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderUpdate {
    Widget(WidgetView),
    WidgetRemoved { id: String },
    Toast(Toast),
    /// Full layout (startup, remote change, on request)
    Snapshot {
        widgets: Vec<WidgetView>,
        ui: UiSettings,
        backend: BackendKind,
        degraded: bool,
    },
    /// Page the surface should open (navigate / more-info)
    OpenUrl { url: String },
}

impl RenderUpdate {
    pub fn removed(id: impl Into<String>) -> Self {
        Self::WidgetRemoved { id: id.into() }
    }

    pub fn open_url(url: impl Into<String>) -> Self {
        Self::OpenUrl { url: url.into() }
    }

    /// One protocol line
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Scroll event as a UI settings update
pub fn scroll_update(x: f64, y: f64) -> Option<UiSettings> {
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    Some(UiSettings {
        scroll_position: Some(ScrollPosition { x, y }),
        ..UiSettings::default()
    })
}
