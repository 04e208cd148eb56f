//! Widget data structures - the persisted unit of floor-plan layout
//!
//! These are pure data structures with NO storage or rendering logic.
//! The store mutates them, backends serialize them, the surface reads them.

use super::action::{ActionDescriptor, ServiceCall};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Canvas-space coordinates, encoded on disk as `"x y"`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Build a position, rejecting NaN and infinite components
    pub fn new(x: f64, y: f64) -> Option<Self> {
        if x.is_finite() && y.is_finite() {
            Some(Self { x, y })
        } else {
            None
        }
    }
}

/// Widget size in canvas units, encoded on disk as `"width height"`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Option<Self> {
        if width.is_finite() && height.is_finite() && width >= 0.0 && height >= 0.0 {
            Some(Self { width, height })
        } else {
            None
        }
    }
}

/// Error for malformed `"a b"` pair strings
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid coordinate pair: {0:?}")]
pub struct PairParseError(pub String);

fn parse_pair(s: &str) -> Result<(f64, f64), PairParseError> {
    let mut parts = s.split_whitespace();
    let a = parts.next().and_then(|p| p.parse::<f64>().ok());
    let b = parts.next().and_then(|p| p.parse::<f64>().ok());
    match (a, b, parts.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(PairParseError(s.to_string())),
    }
}

impl FromStr for Position {
    type Err = PairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = parse_pair(s)?;
        Position::new(x, y).ok_or_else(|| PairParseError(s.to_string()))
    }
}

impl FromStr for Size {
    type Err = PairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = parse_pair(s)?;
        Size::new(w, h).ok_or_else(|| PairParseError(s.to_string()))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.x, self.y)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.width, self.height)
    }
}

macro_rules! pair_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

pair_serde!(Position);
pair_serde!(Size);

/// Deserialize an optional pair, turning garbage ("NaN 0", "", numbers) into None
///
/// Stored layouts written by older clients contain NaN coordinates; those
/// widgets load as positionless instead of failing the whole document.
pub fn lenient_pair<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Synthetic palette token for an entity id: a negative number derived from
/// a 31-multiplier string hash, so the same entity always maps to the same token
pub fn synthetic_id(entity_id: &str) -> String {
    let hash = entity_id
        .chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32));
    format!("-{}", hash as u64 + 1)
}

/// True for ids like "-12345" (negative integers only)
pub fn is_synthetic_id(id: &str) -> bool {
    id.strip_prefix('-')
        .map(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// One widget on the floor plan, keyed by hub entity id
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    /// Entity id (or a synthetic negative token before resolution)
    #[serde(rename = "entityName")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_pair", skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, deserialize_with = "lenient_pair", skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_action: Option<ActionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_action: Option<ActionDescriptor>,
    /// Free-form service call bound to the widget (service picker)
    #[serde(default, rename = "haAction", skip_serializing_if = "Option::is_none")]
    pub hub_action: Option<ServiceCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_color_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_color_off: Option<String>,
}

impl Widget {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Label shown on the canvas (None = hidden)
    pub fn display_label<'a>(&'a self, friendly_name: &'a str, labels_visible: bool) -> Option<&'a str> {
        if !labels_visible || self.label_visible == Some(false) {
            return None;
        }
        Some(self.label_name.as_deref().unwrap_or(friendly_name))
    }

    /// Format an entity state with the widget's prefix/suffix
    pub fn format_value(&self, state: &str) -> Option<String> {
        if self.state_visible == Some(false) {
            return None;
        }
        Some(format!(
            "{}{}{}",
            self.value_prefix.as_deref().unwrap_or(""),
            state,
            self.value_suffix.as_deref().unwrap_or("")
        ))
    }
}

/// Three-state field update: omitted, set, or explicitly deleted
///
/// In JSON an absent key is `Keep`, `null` is `Delete`, anything else is `Set`.
#[derive(Clone, Debug, PartialEq)]
pub enum Patch<T> {
    Keep,
    Set(T),
    Delete,
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }

    /// Resolve against the current value: None = untouched, Some(None) = field removed
    fn resolve(self, current: &Option<T>) -> Option<Option<T>> {
        match self {
            Patch::Keep => None,
            Patch::Set(v) => Some(Some(v)),
            Patch::Delete => {
                if current.is_some() {
                    Some(None)
                } else {
                    None
                }
            }
        }
    }
}

impl Patch<String> {
    /// Empty strings collapse into deletes for display-override text fields
    fn collapse_empty(self) -> Self {
        match self {
            Patch::Set(s) if s.is_empty() => Patch::Delete,
            other => other,
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Delete,
        }
    }
}

/// serde helper: `#[serde(default, deserialize_with = "patch_field")]`
pub fn patch_field<'de, D, T>(deserializer: D) -> Result<Patch<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.into())
}

/// Partial widget update as emitted by the surface or the CLI
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetPatch {
    #[serde(default, deserialize_with = "patch_field")]
    pub position: Patch<Position>,
    #[serde(default, deserialize_with = "patch_field")]
    pub size: Patch<Size>,
    #[serde(default, deserialize_with = "patch_field")]
    pub icon: Patch<String>,
    #[serde(default, deserialize_with = "patch_field")]
    pub tap_action: Patch<ActionDescriptor>,
    #[serde(default, deserialize_with = "patch_field")]
    pub hold_action: Patch<ActionDescriptor>,
    #[serde(default, rename = "haAction", deserialize_with = "patch_field")]
    pub hub_action: Patch<ServiceCall>,
    #[serde(default, deserialize_with = "patch_field")]
    pub label_name: Patch<String>,
    #[serde(default, deserialize_with = "patch_field")]
    pub label_visible: Patch<bool>,
    #[serde(default, deserialize_with = "patch_field")]
    pub state_visible: Patch<bool>,
    #[serde(default, deserialize_with = "patch_field")]
    pub value_prefix: Patch<String>,
    #[serde(default, deserialize_with = "patch_field")]
    pub value_suffix: Patch<String>,
    #[serde(default, deserialize_with = "patch_field")]
    pub icon_color_on: Patch<String>,
    #[serde(default, deserialize_with = "patch_field")]
    pub icon_color_off: Patch<String>,
}

impl WidgetPatch {
    pub fn position(position: Position) -> Self {
        Self {
            position: Patch::Set(position),
            ..Self::default()
        }
    }

    pub fn size(size: Size) -> Self {
        Self {
            size: Patch::Set(size),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Layer a newer patch over this one (newer fields win, Keep falls through)
    pub fn merge(&mut self, newer: WidgetPatch) {
        fn take<T>(slot: &mut Patch<T>, newer: Patch<T>) {
            if !newer.is_keep() {
                *slot = newer;
            }
        }
        take(&mut self.position, newer.position);
        take(&mut self.size, newer.size);
        take(&mut self.icon, newer.icon);
        take(&mut self.tap_action, newer.tap_action);
        take(&mut self.hold_action, newer.hold_action);
        take(&mut self.hub_action, newer.hub_action);
        take(&mut self.label_name, newer.label_name);
        take(&mut self.label_visible, newer.label_visible);
        take(&mut self.state_visible, newer.state_visible);
        take(&mut self.value_prefix, newer.value_prefix);
        take(&mut self.value_suffix, newer.value_suffix);
        take(&mut self.icon_color_on, newer.icon_color_on);
        take(&mut self.icon_color_off, newer.icon_color_off);
    }

    /// Apply onto a widget, returning true if any stored value changed
    pub fn apply(self, widget: &mut Widget) -> bool {
        fn set<T: Clone + PartialEq>(slot: &mut Option<T>, patch: Patch<T>) -> bool {
            match patch.resolve(slot) {
                Some(next) if next != *slot => {
                    *slot = next;
                    true
                }
                _ => false,
            }
        }

        let mut changed = false;
        changed |= set(&mut widget.position, self.position);
        changed |= set(&mut widget.size, self.size);
        changed |= set(&mut widget.icon, self.icon.collapse_empty());
        changed |= set(&mut widget.tap_action, self.tap_action);
        changed |= set(&mut widget.hold_action, self.hold_action);
        changed |= set(&mut widget.hub_action, self.hub_action);
        changed |= set(&mut widget.label_name, self.label_name.collapse_empty());
        changed |= set(&mut widget.label_visible, self.label_visible);
        changed |= set(&mut widget.state_visible, self.state_visible);
        changed |= set(&mut widget.value_prefix, self.value_prefix.collapse_empty());
        changed |= set(&mut widget.value_suffix, self.value_suffix.collapse_empty());
        changed |= set(&mut widget.icon_color_on, self.icon_color_on.collapse_empty());
        changed |= set(&mut widget.icon_color_off, self.icon_color_off.collapse_empty());
        changed
    }
}
