//! Action descriptors bound to widget tap/hold gestures
//!
//! Stored in the same JSON shape the browser dashboard used
//! (`{"action": "call-service", "service": "light.turn_on", ...}`) so that
//! existing layouts keep working.

use serde::{Deserialize, Serialize};

/// What a tap or hold on a widget does
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ActionDescriptor {
    /// `{domain}.toggle` on the widget's entity
    Toggle,
    /// Open the entity's detail page on the hub
    MoreInfo,
    /// Open a hub page (None = the entity's history)
    Navigate {
        #[serde(
            default,
            rename = "navigation_path",
            skip_serializing_if = "Option::is_none"
        )]
        path: Option<String>,
    },
    /// Invoke an arbitrary hub service, e.g. `light.turn_on`
    CallService {
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ServiceTarget>,
    },
}

impl ActionDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionDescriptor::Toggle => "toggle",
            ActionDescriptor::MoreInfo => "more-info",
            ActionDescriptor::Navigate { .. } => "navigate",
            ActionDescriptor::CallService { .. } => "call-service",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

/// Service call picked from the hub's service list
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,
    #[serde(
        default,
        rename = "serviceData",
        skip_serializing_if = "serde_json::Map::is_empty"
    )]
    pub service_data: serde_json::Map<String, serde_json::Value>,
}

/// A `domain.service` pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceName {
    pub domain: String,
    pub service: String,
}

impl ServiceName {
    /// Split `light.turn_on`; None when either half is missing
    pub fn parse(full: &str) -> Option<Self> {
        let (domain, service) = full.split_once('.')?;
        if domain.is_empty() || service.is_empty() {
            return None;
        }
        Some(Self {
            domain: domain.to_string(),
            service: service.to_string(),
        })
    }

    /// "light.turn_on" -> "Turn On"
    pub fn display_name(&self) -> String {
        self.service
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Tap + hold pair as stored in the legacy per-id action map
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_action: Option<ActionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_action: Option<ActionDescriptor>,
}

impl ActionPair {
    pub fn is_empty(&self) -> bool {
        self.tap_action.is_none() && self.hold_action.is_none()
    }

    /// Parse leniently: an unknown or malformed half is dropped, the other kept
    pub fn from_value(value: &serde_json::Value) -> Self {
        let half = |key: &str| {
            value.get(key).filter(|v| !v.is_null()).and_then(|v| {
                match serde_json::from_value::<ActionDescriptor>(v.clone()) {
                    Ok(action) => Some(action),
                    Err(e) => {
                        tracing::warn!("Dropping unreadable {} ({}): {}", key, v, e);
                        None
                    }
                }
            })
        };
        Self {
            tap_action: half("tapAction"),
            hold_action: half("holdAction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_json_shape() {
        let nav: ActionDescriptor =
            serde_json::from_value(json!({"action": "navigate", "navigation_path": "/lovelace/0"}))
                .unwrap();
        assert_eq!(
            nav,
            ActionDescriptor::Navigate {
                path: Some("/lovelace/0".to_string())
            }
        );

        let call = ActionDescriptor::CallService {
            service: "light.turn_on".to_string(),
            target: Some(ServiceTarget {
                entity_id: Some("light.hall".to_string()),
            }),
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"action": "call-service", "service": "light.turn_on", "target": {"entity_id": "light.hall"}})
        );

        let toggle: ActionDescriptor = serde_json::from_value(json!({"action": "toggle"})).unwrap();
        assert_eq!(toggle.kind(), "toggle");
    }

    #[test]
    fn test_service_name_parse() {
        let name = ServiceName::parse("light.turn_on").unwrap();
        assert_eq!(name.domain, "light");
        assert_eq!(name.service, "turn_on");
        assert_eq!(name.display_name(), "Turn On");

        assert!(ServiceName::parse("toggle").is_none());
        assert!(ServiceName::parse(".turn_on").is_none());
        assert!(ServiceName::parse("light.").is_none());
    }

    #[test]
    fn test_action_pair_drops_unknown_half() {
        let pair = ActionPair::from_value(&json!({
            "tapAction": {"action": "toggle"},
            "holdAction": {"action": "explode"}
        }));
        assert_eq!(pair.tap_action, Some(ActionDescriptor::Toggle));
        assert_eq!(pair.hold_action, None);
    }
}
