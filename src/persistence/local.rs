//! Local backend: widgets projected onto the legacy flat cache keys
//!
//! Each widget attribute lives in its own id-keyed map (`ha_dashboard_positions`,
//! `ha_dashboard_sizes`, ...) next to the ordered id list. Layouts saved by
//! the browser dashboard load unchanged.

use super::local_cache::LocalCache;
use super::{BackendError, BackendKind, Collection, WidgetBackend};
use crate::data::{ActionPair, Position, ScrollPosition, ServiceCall, Size, UiSettings, Widget};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const KEY_ENTITIES: &str = "ha_dashboard_entities";
pub const KEY_POSITIONS: &str = "ha_dashboard_positions";
pub const KEY_SIZES: &str = "ha_dashboard_sizes";
pub const KEY_ICONS: &str = "ha_dashboard_icons";
pub const KEY_ACTIONS: &str = "ha_dashboard_actions";
pub const KEY_LABEL_OVERRIDES: &str = "ha_dashboard_label_overrides";
pub const KEY_HUB_ACTIONS: &str = "ha_dashboard_ha_actions";
pub const KEY_LABEL_VISIBLE: &str = "ha_dashboard_label_visible";
pub const KEY_STATE_VISIBLE: &str = "ha_dashboard_state_visible";
pub const KEY_VALUE_PREFIXES: &str = "ha_dashboard_value_prefixes";
pub const KEY_VALUE_SUFFIXES: &str = "ha_dashboard_value_suffixes";
pub const KEY_ICON_COLORS: &str = "ha_dashboard_icon_colors";

pub const KEY_SCALE: &str = "ha_dashboard_scale";
pub const KEY_PAN_X: &str = "ha_dashboard_pan_x";
pub const KEY_PAN_Y: &str = "ha_dashboard_pan_y";
pub const KEY_LABELS_VISIBLE: &str = "ha_dashboard_labels_visible";
pub const KEY_SIDEBAR_VISIBLE: &str = "ha_dashboard_sidebar_visible";
pub const KEY_SCROLL_POSITION: &str = "ha_dashboard_scroll_position";

/// Per-widget label visibility written by the oldest dashboard builds
const LEGACY_LABEL_VISIBLE_PREFIX: &str = "ha_dashboard_widget_label_visible_";

/// Every id-keyed projection, for removal and full rewrites
const WIDGET_MAPS: &[&str] = &[
    KEY_POSITIONS,
    KEY_SIZES,
    KEY_ICONS,
    KEY_ACTIONS,
    KEY_LABEL_OVERRIDES,
    KEY_HUB_ACTIONS,
    KEY_LABEL_VISIBLE,
    KEY_STATE_VISIBLE,
    KEY_VALUE_PREFIXES,
    KEY_VALUE_SUFFIXES,
    KEY_ICON_COLORS,
];

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct IconColors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    off: Option<String>,
}

/// Column view of one widget: (map key, encoded value or None to drop the entry)
fn projections(widget: &Widget) -> Vec<(&'static str, Option<Value>)> {
    fn text(v: &Option<String>) -> Option<Value> {
        v.as_ref().map(|s| Value::String(s.clone()))
    }
    fn encode<T: Serialize>(v: Option<&T>) -> Option<Value> {
        v.and_then(|v| serde_json::to_value(v).ok())
    }

    let actions = ActionPair {
        tap_action: widget.tap_action.clone(),
        hold_action: widget.hold_action.clone(),
    };
    let colors = IconColors {
        on: widget.icon_color_on.clone(),
        off: widget.icon_color_off.clone(),
    };

    vec![
        (KEY_POSITIONS, encode(widget.position.as_ref())),
        (KEY_SIZES, encode(widget.size.as_ref())),
        (KEY_ICONS, text(&widget.icon)),
        (KEY_ACTIONS, encode(Some(&actions).filter(|a| !a.is_empty()))),
        (KEY_LABEL_OVERRIDES, text(&widget.label_name)),
        (KEY_HUB_ACTIONS, encode(widget.hub_action.as_ref())),
        (KEY_LABEL_VISIBLE, widget.label_visible.map(Value::Bool)),
        (KEY_STATE_VISIBLE, widget.state_visible.map(Value::Bool)),
        (KEY_VALUE_PREFIXES, text(&widget.value_prefix)),
        (KEY_VALUE_SUFFIXES, text(&widget.value_suffix)),
        (KEY_ICON_COLORS, encode(Some(&colors).filter(|c| **c != IconColors::default()))),
    ]
}

pub struct LocalBackend {
    cache: Mutex<LocalCache>,
}

impl LocalBackend {
    pub fn new(cache: LocalCache) -> Self {
        Self {
            cache: Mutex::new(cache),
        }
    }

    fn with_cache<T>(&self, f: impl FnOnce(&mut LocalCache) -> Result<T, BackendError>) -> Result<T, BackendError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| BackendError::Data("local cache lock poisoned".into()))?;
        f(&mut cache)
    }

    fn flush(cache: &mut LocalCache) -> Result<(), BackendError> {
        cache
            .flush()
            .map_err(|e| BackendError::Transport(format!("{:#}", e)))
    }

    fn read_ids(cache: &LocalCache) -> Vec<String> {
        cache.get_json::<Vec<String>>(KEY_ENTITIES).unwrap_or_default()
    }

    fn read_map(cache: &LocalCache, key: &str) -> Map<String, Value> {
        cache.get_json::<Map<String, Value>>(key).unwrap_or_default()
    }

    fn write_map(cache: &mut LocalCache, key: &str, map: &Map<String, Value>) -> Result<(), BackendError> {
        if map.is_empty() {
            cache.remove(key);
            return Ok(());
        }
        cache
            .set_json(key, map)
            .map_err(|e| BackendError::Data(format!("{:#}", e)))
    }

    fn write_ids(cache: &mut LocalCache, ids: &[String]) -> Result<(), BackendError> {
        cache
            .set_json(KEY_ENTITIES, ids)
            .map_err(|e| BackendError::Data(format!("{:#}", e)))
    }

    /// Rebuild the collection from the projections
    fn read_collection(cache: &mut LocalCache) -> Result<Collection, BackendError> {
        let mut ids = Self::read_ids(cache);
        let maps: BTreeMap<&str, Map<String, Value>> = WIDGET_MAPS
            .iter()
            .map(|key| (*key, Self::read_map(cache, key)))
            .collect();

        // Positions recorded for ids missing from the id list: re-list them
        let mut healed = false;
        if let Some(positions) = maps.get(KEY_POSITIONS) {
            for id in positions.keys() {
                if !ids.contains(id) {
                    warn!("Widget {} had a position but was not listed; restoring it", id);
                    ids.push(id.clone());
                    healed = true;
                }
            }
        }
        if healed {
            Self::write_ids(cache, &ids)?;
            Self::flush(cache)?;
        }

        let field = |key: &str, id: &str| -> Option<&Value> {
            maps.get(key).and_then(|m| m.get(id)).filter(|v| !v.is_null())
        };
        let text = |key: &str, id: &str| -> Option<String> {
            field(key, id)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let mut collection = Collection::new();
        for id in ids {
            if id.is_empty() || collection.contains_key(&id) {
                continue;
            }
            let mut widget = Widget::new(id.clone());

            widget.position = field(KEY_POSITIONS, &id).and_then(|v| {
                let parsed = v.as_str().and_then(|s| s.parse::<Position>().ok());
                if parsed.is_none() {
                    warn!("Dropping unusable position {} for {}", v, id);
                }
                parsed
            });
            widget.size = field(KEY_SIZES, &id)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Size>().ok());
            widget.icon = text(KEY_ICONS, &id);

            if let Some(actions) = field(KEY_ACTIONS, &id) {
                let pair = ActionPair::from_value(actions);
                widget.tap_action = pair.tap_action;
                widget.hold_action = pair.hold_action;
            }
            widget.hub_action = field(KEY_HUB_ACTIONS, &id)
                .and_then(|v| serde_json::from_value::<ServiceCall>(v.clone()).ok());
            widget.label_name = text(KEY_LABEL_OVERRIDES, &id);
            widget.label_visible = field(KEY_LABEL_VISIBLE, &id)
                .and_then(Value::as_bool)
                .or_else(|| {
                    cache
                        .get_json::<bool>(&format!("{}{}", LEGACY_LABEL_VISIBLE_PREFIX, id))
                });
            widget.state_visible = field(KEY_STATE_VISIBLE, &id).and_then(Value::as_bool);
            widget.value_prefix = text(KEY_VALUE_PREFIXES, &id);
            widget.value_suffix = text(KEY_VALUE_SUFFIXES, &id);
            if let Some(colors) = field(KEY_ICON_COLORS, &id)
                .and_then(|v| serde_json::from_value::<IconColors>(v.clone()).ok())
            {
                widget.icon_color_on = colors.on;
                widget.icon_color_off = colors.off;
            }

            collection.insert(id, widget);
        }

        Ok(collection)
    }

    fn write_widget(cache: &mut LocalCache, widget: &Widget) -> Result<(), BackendError> {
        let mut ids = Self::read_ids(cache);
        if !ids.contains(&widget.id) {
            ids.push(widget.id.clone());
            Self::write_ids(cache, &ids)?;
        }

        for (key, value) in projections(widget) {
            let mut map = Self::read_map(cache, key);
            match value {
                Some(v) => {
                    map.insert(widget.id.clone(), v);
                }
                None => {
                    map.remove(&widget.id);
                }
            }
            Self::write_map(cache, key, &map)?;
        }

        // The per-widget key is superseded by the label-visible map
        cache.remove(&format!("{}{}", LEGACY_LABEL_VISIBLE_PREFIX, widget.id));
        Ok(())
    }

    fn erase_widget(cache: &mut LocalCache, id: &str) -> Result<(), BackendError> {
        let mut ids = Self::read_ids(cache);
        ids.retain(|existing| existing != id);
        Self::write_ids(cache, &ids)?;

        for key in WIDGET_MAPS {
            let mut map = Self::read_map(cache, key);
            if map.remove(id).is_some() {
                Self::write_map(cache, key, &map)?;
            }
        }
        cache.remove(&format!("{}{}", LEGACY_LABEL_VISIBLE_PREFIX, id));
        Ok(())
    }
}

#[async_trait]
impl WidgetBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn load(&self) -> Result<Collection, BackendError> {
        self.with_cache(|cache| {
            let collection = Self::read_collection(cache)?;
            debug!("Loaded {} widgets from local cache", collection.len());
            Ok(collection)
        })
    }

    async fn upsert(&self, widget: &Widget) -> Result<(), BackendError> {
        self.with_cache(|cache| {
            Self::write_widget(cache, widget)?;
            Self::flush(cache)
        })
    }

    async fn remove(&self, id: &str) -> Result<(), BackendError> {
        self.with_cache(|cache| {
            Self::erase_widget(cache, id)?;
            Self::flush(cache)
        })
    }

    async fn save_collection(&self, widgets: &Collection, explicit: bool) -> Result<(), BackendError> {
        self.with_cache(|cache| {
            if widgets.is_empty() && !explicit && !Self::read_ids(cache).is_empty() {
                warn!("Refusing to overwrite stored layout with an empty collection");
                return Ok(());
            }

            let legacy: Vec<String> = cache
                .keys_with_prefix(LEGACY_LABEL_VISIBLE_PREFIX)
                .map(str::to_string)
                .collect();
            for key in legacy {
                cache.remove(&key);
            }

            let mut maps: BTreeMap<&str, Map<String, Value>> =
                WIDGET_MAPS.iter().map(|key| (*key, Map::new())).collect();
            for widget in widgets.values() {
                for (key, value) in projections(widget) {
                    if let (Some(map), Some(value)) = (maps.get_mut(key), value) {
                        map.insert(widget.id.clone(), value);
                    }
                }
            }

            let ids: Vec<String> = widgets.keys().cloned().collect();
            Self::write_ids(cache, &ids)?;
            for (key, map) in &maps {
                Self::write_map(cache, key, map)?;
            }

            info!("Saved {} widgets to local cache", ids.len());
            Self::flush(cache)
        })
    }

    async fn load_ui(&self) -> Result<UiSettings, BackendError> {
        self.with_cache(|cache| {
            let pan = match (
                cache.get_json::<f64>(KEY_PAN_X),
                cache.get_json::<f64>(KEY_PAN_Y),
            ) {
                (Some(x), Some(y)) => Some(ScrollPosition { x, y }),
                _ => None,
            };
            Ok(UiSettings {
                labels_visible: cache.get_json(KEY_LABELS_VISIBLE),
                sidebar_visible: cache.get_json(KEY_SIDEBAR_VISIBLE),
                scroll_position: cache.get_json(KEY_SCROLL_POSITION),
                scale: cache
                    .get_json::<f64>(KEY_SCALE)
                    .filter(|s| s.is_finite() && *s > 0.0),
                pan,
            })
        })
    }

    async fn save_ui(&self, ui: &UiSettings) -> Result<(), BackendError> {
        self.with_cache(|cache| {
            let encode = |e: anyhow::Error| BackendError::Data(format!("{:#}", e));
            if let Some(v) = ui.labels_visible {
                cache.set_json(KEY_LABELS_VISIBLE, &v).map_err(encode)?;
            }
            if let Some(v) = ui.sidebar_visible {
                cache.set_json(KEY_SIDEBAR_VISIBLE, &v).map_err(encode)?;
            }
            if let Some(v) = &ui.scroll_position {
                cache.set_json(KEY_SCROLL_POSITION, v).map_err(encode)?;
            }
            if let Some(v) = ui.scale {
                cache.set_json(KEY_SCALE, &v).map_err(encode)?;
            }
            if let Some(pan) = &ui.pan {
                cache.set_json(KEY_PAN_X, &pan.x).map_err(encode)?;
                cache.set_json(KEY_PAN_Y, &pan.y).map_err(encode)?;
            }
            Self::flush(cache)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ActionDescriptor, Position};
    use serde_json::json;

    fn backend_with(entries: &[(&str, Value)]) -> LocalBackend {
        let mut cache = LocalCache::in_memory();
        for (key, value) in entries {
            cache.set_json(key, value).unwrap();
        }
        LocalBackend::new(cache)
    }

    #[tokio::test]
    async fn test_upsert_then_load_returns_position() {
        let backend = backend_with(&[]);
        let mut widget = Widget::new("sensor.front_door");
        widget.position = Position::new(120.0, 340.0);
        backend.upsert(&widget).await.unwrap();

        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded["sensor.front_door"].position, Position::new(120.0, 340.0));
        assert_eq!(loaded["sensor.front_door"].size, None);
    }

    #[tokio::test]
    async fn test_legacy_layout_loads() {
        let backend = backend_with(&[
            (KEY_ENTITIES, json!(["light.hall", "sensor.temp"])),
            (KEY_POSITIONS, json!({"light.hall": "10 20", "sensor.temp": "NaN NaN"})),
            (KEY_SIZES, json!({"light.hall": "80 40"})),
            (KEY_ACTIONS, json!({"light.hall": {"tapAction": {"action": "toggle"}}})),
            (KEY_LABEL_OVERRIDES, json!({"sensor.temp": "Outside"})),
            ("ha_dashboard_widget_label_visible_sensor.temp", json!(false)),
        ]);

        let loaded = backend.load().await.unwrap();
        let hall = &loaded["light.hall"];
        assert_eq!(hall.position, Position::new(10.0, 20.0));
        assert_eq!(hall.tap_action, Some(ActionDescriptor::Toggle));

        let temp = &loaded["sensor.temp"];
        assert_eq!(temp.position, None);
        assert_eq!(temp.label_name.as_deref(), Some("Outside"));
        assert_eq!(temp.label_visible, Some(false));
    }

    #[tokio::test]
    async fn test_unlisted_position_is_self_healed() {
        let backend = backend_with(&[
            (KEY_ENTITIES, json!(["sensor.a"])),
            (KEY_POSITIONS, json!({"sensor.a": "1 1", "sensor.b": "2 2"})),
        ]);

        let loaded = backend.load().await.unwrap();
        assert!(loaded.contains_key("sensor.b"));
        let ids = backend
            .with_cache(|c| Ok(LocalBackend::read_ids(c)))
            .unwrap();
        assert_eq!(ids, vec!["sensor.a".to_string(), "sensor.b".to_string()]);
    }

    #[tokio::test]
    async fn test_upsert_removes_cleared_fields() {
        let backend = backend_with(&[]);
        let mut widget = Widget::new("sensor.power");
        widget.value_prefix = Some("$".to_string());
        backend.upsert(&widget).await.unwrap();

        widget.value_prefix = None;
        backend.upsert(&widget).await.unwrap();

        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded["sensor.power"].value_prefix, None);
        let prefixes = backend
            .with_cache(|c| Ok(c.get(KEY_VALUE_PREFIXES).map(str::to_string)))
            .unwrap();
        assert_eq!(prefixes, None);
    }

    #[tokio::test]
    async fn test_remove_erases_every_projection() {
        let backend = backend_with(&[("ha_dashboard_widget_label_visible_light.a", json!(true))]);
        let mut widget = Widget::new("light.a");
        widget.position = Position::new(1.0, 2.0);
        widget.icon = Some("lamp".to_string());
        backend.upsert(&widget).await.unwrap();

        backend.remove("light.a").await.unwrap();
        assert!(backend.load().await.unwrap().is_empty());
        let leftovers = backend
            .with_cache(|c| Ok(c.get(KEY_ICONS).is_some() || c.get(KEY_POSITIONS).is_some()))
            .unwrap();
        assert!(!leftovers);
    }

    #[tokio::test]
    async fn test_implicit_empty_save_is_refused() {
        let backend = backend_with(&[]);
        let mut widget = Widget::new("sensor.a");
        widget.position = Position::new(1.0, 1.0);
        backend.upsert(&widget).await.unwrap();

        backend.save_collection(&Collection::new(), false).await.unwrap();
        assert_eq!(backend.load().await.unwrap().len(), 1);

        backend.save_collection(&Collection::new(), true).await.unwrap();
        assert!(backend.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ui_settings_round_trip() {
        let backend = backend_with(&[]);
        let ui = UiSettings {
            labels_visible: Some(false),
            scroll_position: Some(ScrollPosition { x: 5.0, y: 9.0 }),
            scale: Some(1.25),
            pan: Some(ScrollPosition { x: -3.0, y: 4.0 }),
            ..UiSettings::default()
        };
        backend.save_ui(&ui).await.unwrap();
        assert_eq!(backend.load_ui().await.unwrap(), ui);
    }
}
