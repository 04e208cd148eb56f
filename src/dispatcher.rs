//! Action dispatcher - runs a widget's tap/hold action against the hub
//!
//! Failures come back as a toast in the `Dispatch` result, never as an
//! error: a broken action must not take the event loop down with it.

use crate::data::{ActionDescriptor, ServiceCall, ServiceName, Widget};
use crate::hub::{HubApi, HubError};
use crate::notify::Toast;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Delay before re-reading states after a toggle
pub const TOGGLE_REFRESH_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    Tap,
    Hold,
}

/// What happened, for the caller to act on
#[derive(Debug, Default, PartialEq)]
pub struct Dispatch {
    /// Hub page for the surface to open
    pub open_url: Option<String>,
    pub toast: Option<Toast>,
    /// Re-read entity states after this delay
    pub refresh_after: Option<Duration>,
}

impl Dispatch {
    fn failed(toast: Toast) -> Self {
        Self {
            toast: Some(toast),
            ..Self::default()
        }
    }
}

pub struct ActionDispatcher {
    hub: Arc<dyn HubApi>,
}

impl ActionDispatcher {
    pub fn new(hub: Arc<dyn HubApi>) -> Self {
        Self { hub }
    }

    /// `/path` or `path` joined to the hub address; absolute URLs pass through
    pub fn hub_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let address = self.hub.address().trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", address, path)
        } else {
            format!("{}/{}", address, path)
        }
    }

    /// The action bound to a gesture; tap falls back to the widget's service call
    pub async fn dispatch_gesture(&self, widget: &Widget, gesture: Gesture) -> Dispatch {
        let action = match gesture {
            Gesture::Tap => widget.tap_action.as_ref(),
            Gesture::Hold => widget.hold_action.as_ref(),
        };
        match (action, gesture, &widget.hub_action) {
            (Some(action), _, _) => self.dispatch(&widget.id, action).await,
            (None, Gesture::Tap, Some(call)) => self.dispatch_service_call(&widget.id, call).await,
            _ => {
                debug!("No {:?} action on {}", gesture, widget.id);
                Dispatch::default()
            }
        }
    }

    pub async fn dispatch(&self, entity_id: &str, action: &ActionDescriptor) -> Dispatch {
        if entity_id.is_empty() {
            return Dispatch::failed(Toast::error("Widget has no entity"));
        }
        debug!("Dispatching {} for {}", action.kind(), entity_id);

        match action {
            ActionDescriptor::Toggle => self.toggle(entity_id).await,
            ActionDescriptor::MoreInfo => Dispatch {
                open_url: Some(self.hub_url(&format!("/config/entities/{}", entity_id))),
                ..Dispatch::default()
            },
            ActionDescriptor::Navigate { path } => {
                let path = path
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("/history?entity_id={}", entity_id));
                Dispatch {
                    open_url: Some(self.hub_url(&path)),
                    ..Dispatch::default()
                }
            }
            ActionDescriptor::CallService { service, target } => {
                let target_id = target
                    .as_ref()
                    .and_then(|t| t.entity_id.as_deref())
                    .unwrap_or(entity_id);
                let mut data = Map::new();
                data.insert("entity_id".to_string(), Value::String(target_id.to_string()));
                self.call(service, data).await
            }
        }
    }

    /// Run a service call picked from the service list
    pub async fn dispatch_service_call(&self, entity_id: &str, call: &ServiceCall) -> Dispatch {
        let mut data = call.service_data.clone();
        data.entry("entity_id")
            .or_insert_with(|| Value::String(entity_id.to_string()));
        self.call(&call.service, data).await
    }

    async fn toggle(&self, entity_id: &str) -> Dispatch {
        let domain = entity_id.split('.').next().unwrap_or_default();
        let result = self
            .hub
            .call_service(domain, "toggle", json!({ "entity_id": entity_id }))
            .await;
        match result {
            Ok(_) => {
                info!("Toggled {}", entity_id);
                Dispatch {
                    refresh_after: Some(TOGGLE_REFRESH_DELAY),
                    ..Dispatch::default()
                }
            }
            Err(e) => Self::report("toggle", entity_id, e),
        }
    }

    async fn call(&self, service: &str, data: Map<String, Value>) -> Dispatch {
        let Some(name) = ServiceName::parse(service) else {
            error!("Invalid service format: {:?}", service);
            return Dispatch::failed(Toast::error(format!("Invalid service: {}", service)));
        };
        match self
            .hub
            .call_service(&name.domain, &name.service, Value::Object(data))
            .await
        {
            Ok(_) => {
                info!("Called {}", service);
                Dispatch {
                    toast: Some(Toast::success(format!("{} sent", name.display_name()))),
                    refresh_after: Some(TOGGLE_REFRESH_DELAY),
                    ..Dispatch::default()
                }
            }
            Err(e) => Self::report("call", service, e),
        }
    }

    fn report(what: &str, subject: &str, e: HubError) -> Dispatch {
        error!("Failed to {} {}: {}", what, subject, e);
        let message = if e.is_auth() {
            "Hub rejected the access token".to_string()
        } else {
            format!("Failed to {} {}: {}", what, subject, e)
        };
        Dispatch::failed(Toast::error(message))
    }
}
