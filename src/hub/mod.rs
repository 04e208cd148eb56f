//! Home Assistant hub access: REST client, WebSocket event channel, wire types
//!
//! Everything here speaks the hub's JSON shapes. The catalog and dispatcher
//! only see `HubApi` and `HubEvent`, so tests can swap the transport out.

pub mod client;
pub mod websocket;

pub use client::HubClient;
pub use websocket::{HubEvent, HubSocket};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Failures talking to the hub
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("hub unreachable: {0}")]
    Transport(String),
    #[error("hub rejected credentials: {0}")]
    Auth(String),
    #[error("unexpected hub response: {0}")]
    Protocol(String),
    #[error("invalid service name: {0}")]
    InvalidService(String),
}

impl HubError {
    pub fn is_auth(&self) -> bool {
        matches!(self, HubError::Auth(_))
    }
}

/// Entity snapshot as returned by `GET /api/states`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubEntityState {
    pub entity_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: HubAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl HubEntityState {
    /// "binary_sensor.front_door" -> "binary_sensor"
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HubAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One domain's entry from `GET /api/services`
#[derive(Clone, Debug, Deserialize)]
pub struct HubServiceDomain {
    pub domain: String,
    #[serde(default)]
    pub services: BTreeMap<String, serde_json::Value>,
}

/// Flattened service listing for pickers and the `services` command
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceEntry {
    pub service: String,
    pub label: String,
    pub domain: String,
}

/// Flatten the per-domain listing, labelled "Turn On (light)" and sorted by label
pub fn flatten_services(domains: &[HubServiceDomain]) -> Vec<ServiceEntry> {
    let mut entries: Vec<ServiceEntry> = domains
        .iter()
        .flat_map(|d| {
            d.services.keys().map(move |name| {
                let service = format!("{}.{}", d.domain, name);
                let label = crate::data::ServiceName::parse(&service)
                    .map(|s| s.display_name())
                    .unwrap_or_else(|| service.clone());
                ServiceEntry {
                    label: format!("{} ({})", label, d.domain),
                    service,
                    domain: d.domain.clone(),
                }
            })
        })
        .collect();
    entries.sort_by(|a, b| a.label.cmp(&b.label));
    entries
}

/// The slice of the hub API the dashboard consumes
#[async_trait]
pub trait HubApi: Send + Sync {
    /// Base address used for page navigation (no trailing slash)
    fn address(&self) -> &str;

    async fn get_states(&self) -> Result<Vec<HubEntityState>, HubError>;

    async fn get_services(&self) -> Result<Vec<HubServiceDomain>, HubError>;

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, HubError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_state_parses_hub_payload() {
        let state: HubEntityState = serde_json::from_value(json!({
            "entity_id": "binary_sensor.front_door",
            "state": "off",
            "attributes": {
                "friendly_name": "Front Door",
                "device_class": "door",
                "battery": 92
            },
            "last_updated": "2024-01-01T00:00:00+00:00"
        }))
        .unwrap();
        assert_eq!(state.domain(), "binary_sensor");
        assert_eq!(state.attributes.device_class.as_deref(), Some("door"));
        assert_eq!(state.attributes.extra.get("battery"), Some(&json!(92)));
    }

    #[test]
    fn test_flatten_services_sorted_and_labelled() {
        let domains: Vec<HubServiceDomain> = serde_json::from_value(json!([
            {"domain": "switch", "services": {"toggle": {}, "turn_off": {}}},
            {"domain": "light", "services": {"turn_on": {"description": "Turn on"}}}
        ]))
        .unwrap();
        let entries = flatten_services(&domains);
        let labels: Vec<&str> = entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["Toggle (switch)", "Turn Off (switch)", "Turn On (light)"]);
        assert_eq!(entries[2].service, "light.turn_on");
    }
}
