//! Entity catalog - the hub's entity list, classified for the palette
//!
//! Built from a `GET /api/states` snapshot and kept current by
//! `state_changed` events. The store asks it whether a widget's entity
//! still exists and which entity a synthetic palette token stands for.

use crate::data::{is_synthetic_id, synthetic_id};
use crate::hub::HubEntityState;
use crate::icons;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Domains that never appear on a floor plan
const EXCLUDED_DOMAINS: &[&str] = &[
    "automation",
    "script",
    "scene",
    "sun",
    "zone",
    "persistent_notification",
    "input_number",
    "input_select",
    "input_text",
    "input_boolean",
];

fn entity_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+$").ok())
        .as_ref()
}

/// "light.kitchen" -> true, "Light Kitchen" -> false
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    entity_id_pattern().map_or(false, |re| re.is_match(entity_id))
}

/// Palette grouping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sensor,
    Door,
    Camera,
    Light,
    Switch,
}

impl Category {
    /// Fixed precedence: domain first, then binary_sensor device class
    pub fn classify(domain: &str, device_class: Option<&str>) -> Self {
        match domain {
            "light" => Category::Light,
            "switch" => Category::Switch,
            "camera" => Category::Camera,
            "binary_sensor" if matches!(device_class, Some("door") | Some("window")) => {
                Category::Door
            }
            _ => Category::Sensor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sensor => "sensor",
            Category::Door => "door",
            Category::Camera => "camera",
            Category::Light => "light",
            Category::Switch => "switch",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sensor" | "sensors" => Ok(Category::Sensor),
            "door" | "doors" => Ok(Category::Door),
            "camera" | "cameras" => Ok(Category::Camera),
            "light" | "lights" => Ok(Category::Light),
            "switch" | "switches" => Ok(Category::Switch),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// One classified entity
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityData {
    pub entity_id: String,
    pub friendly_name: String,
    pub domain: String,
    pub category: Category,
    pub state: String,
    /// Icon name without the `mdi:` prefix
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl EntityData {
    /// None for excluded domains and malformed ids
    pub fn from_state(state: &HubEntityState) -> Option<Self> {
        if !is_valid_entity_id(&state.entity_id) {
            debug!("Skipping malformed entity id {:?}", state.entity_id);
            return None;
        }
        let domain = state.domain();
        if EXCLUDED_DOMAINS.contains(&domain) {
            return None;
        }

        let attrs = &state.attributes;
        let device_class = attrs.device_class.clone();
        let icon = attrs
            .icon
            .as_deref()
            .and_then(icons::normalize_icon)
            .unwrap_or_else(|| icons::default_icon(domain, device_class.as_deref()).to_string());
        let friendly_name = attrs
            .friendly_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| state.entity_id.clone());
        let last_updated = state
            .last_updated
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Some(Self {
            entity_id: state.entity_id.clone(),
            friendly_name,
            domain: domain.to_string(),
            category: Category::classify(domain, device_class.as_deref()),
            state: state.state.clone(),
            icon,
            device_class,
            last_updated,
        })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.state.as_str(), "unavailable" | "unknown")
    }
}

/// The live entity list, keyed by entity id
#[derive(Debug, Default)]
pub struct EntityCatalog {
    entities: BTreeMap<String, EntityData>,
    /// synthetic token -> entity id
    synthetic: HashMap<String, String>,
    loaded: bool,
}

impl EntityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_states(states: &[HubEntityState]) -> Self {
        let mut catalog = Self::new();
        catalog.update_states(states);
        catalog
    }

    /// Replace the whole catalog with a fresh snapshot
    pub fn update_states(&mut self, states: &[HubEntityState]) {
        self.entities.clear();
        self.synthetic.clear();
        for state in states {
            if let Some(entity) = EntityData::from_state(state) {
                self.insert(entity);
            }
        }
        self.loaded = true;
        debug!("Catalog refreshed: {} entities", self.entities.len());
    }

    /// Apply one `state_changed` event; returns the updated entity if it is tracked
    pub fn apply_state(&mut self, entity_id: &str, new_state: Option<&HubEntityState>) -> Option<&EntityData> {
        match new_state.and_then(EntityData::from_state) {
            Some(entity) => {
                self.insert(entity);
                self.entities.get(entity_id)
            }
            None => {
                if self.entities.remove(entity_id).is_some() {
                    self.synthetic.remove(&synthetic_id(entity_id));
                    debug!("Entity {} left the hub", entity_id);
                }
                None
            }
        }
    }

    fn insert(&mut self, entity: EntityData) {
        let token = synthetic_id(&entity.entity_id);
        if let Some(existing) = self.synthetic.get(&token) {
            if existing != &entity.entity_id {
                warn!(
                    "Synthetic id {} collides for {} and {}",
                    token, existing, entity.entity_id
                );
            }
        }
        self.synthetic.insert(token, entity.entity_id.clone());
        self.entities.insert(entity.entity_id.clone(), entity);
    }

    /// True once a snapshot has been applied; an empty unloaded catalog
    /// must not mark every widget unknown
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityData> {
        self.entities.get(entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityData> {
        self.entities.values()
    }

    /// Map a synthetic palette token back to its entity id
    pub fn resolve_synthetic(&self, token: &str) -> Option<&str> {
        if !is_synthetic_id(token) {
            return None;
        }
        self.synthetic.get(token).map(String::as_str)
    }

    /// Palette search: optional category filter, case-insensitive match on
    /// id or friendly name, sorted by friendly name
    pub fn search(&self, category: Option<Category>, query: &str) -> Vec<&EntityData> {
        let query = query.trim().to_lowercase();
        let mut hits: Vec<&EntityData> = self
            .entities
            .values()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .filter(|e| {
                query.is_empty()
                    || e.entity_id.to_lowercase().contains(&query)
                    || e.friendly_name.to_lowercase().contains(&query)
            })
            .collect();
        hits.sort_by(|a, b| {
            a.friendly_name
                .to_lowercase()
                .cmp(&b.friendly_name.to_lowercase())
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        hits
    }

    /// Entity count per category, for the palette headers
    pub fn counts(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for entity in self.entities.values() {
            *counts.entry(entity.category).or_insert(0) += 1;
        }
        counts
    }
}
