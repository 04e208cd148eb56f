//! Live `state_changed` feed over the hub WebSocket API
//!
//! The socket runs on a blocking thread (tungstenite is synchronous) and
//! forwards events to the event loop over an unbounded channel, the same
//! reader-task shape the game connection used.

use super::{HubEntityState, HubError};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tungstenite::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Authenticated and subscribed
    Connected,
    /// Token rejected; live updates stay off for this session
    AuthFailed(String),
    /// An entity changed (None = entity removed from the hub)
    StateChanged {
        entity_id: String,
        new_state: Option<HubEntityState>,
    },
    Disconnected,
}

/// `http://hub:8123` -> `ws://hub:8123/api/websocket`
pub fn websocket_url(address: &str) -> Result<url::Url, HubError> {
    let mut url =
        url::Url::parse(address).map_err(|e| HubError::Protocol(format!("{}: {}", address, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(HubError::Protocol(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| HubError::Protocol(format!("cannot use {} for {}", scheme, address)))?;
    url.set_path("/api/websocket");
    url.set_query(None);
    Ok(url)
}

/// What to do after one inbound frame
#[derive(Debug, Default, PartialEq)]
pub struct SessionStep {
    pub replies: Vec<String>,
    pub events: Vec<HubEvent>,
    pub done: bool,
}

/// Auth + subscribe handshake and event decoding, independent of the socket
pub struct SocketSession {
    access_token: String,
    next_id: u64,
    subscription_id: Option<u64>,
}

impl SocketSession {
    pub fn new(access_token: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
            next_id: 1,
            subscription_id: None,
        }
    }

    pub fn handle(&mut self, text: &str) -> Result<SessionStep, HubError> {
        let msg: serde_json::Value =
            serde_json::from_str(text).map_err(|e| HubError::Protocol(e.to_string()))?;
        let mut step = SessionStep::default();

        match msg["type"].as_str().unwrap_or_default() {
            "auth_required" => {
                step.replies.push(
                    json!({"type": "auth", "access_token": self.access_token}).to_string(),
                );
            }
            "auth_ok" => {
                let id = self.next_id;
                self.next_id += 1;
                self.subscription_id = Some(id);
                step.replies.push(
                    json!({"id": id, "type": "subscribe_events", "event_type": "state_changed"})
                        .to_string(),
                );
                step.events.push(HubEvent::Connected);
            }
            "auth_invalid" => {
                let reason = msg["message"].as_str().unwrap_or("invalid token").to_string();
                step.events.push(HubEvent::AuthFailed(reason));
                step.done = true;
            }
            "result" => {
                if msg["success"].as_bool() == Some(false) {
                    warn!("Hub rejected request {}: {}", msg["id"], msg["error"]);
                }
            }
            "event" => {
                if msg["id"].as_u64() != self.subscription_id {
                    debug!("Ignoring event for unknown subscription {}", msg["id"]);
                    return Ok(step);
                }
                let event = &msg["event"];
                if event["event_type"] != "state_changed" {
                    return Ok(step);
                }
                let data = &event["data"];
                let Some(entity_id) = data["entity_id"].as_str() else {
                    return Err(HubError::Protocol("state_changed without entity_id".into()));
                };
                let new_state = if data["new_state"].is_null() {
                    None
                } else {
                    Some(
                        serde_json::from_value(data["new_state"].clone())
                            .map_err(|e| HubError::Protocol(e.to_string()))?,
                    )
                };
                step.events.push(HubEvent::StateChanged {
                    entity_id: entity_id.to_string(),
                    new_state,
                });
            }
            other => debug!("Ignoring hub message type {:?}", other),
        }

        Ok(step)
    }
}

pub struct HubSocket;

impl HubSocket {
    /// Connect on a blocking thread; always ends with `HubEvent::Disconnected`
    /// unless the receiver went away first
    pub fn spawn(
        address: String,
        access_token: String,
        event_tx: mpsc::UnboundedSender<HubEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            if let Err(e) = Self::run(&address, &access_token, &event_tx) {
                error!("Hub socket error: {}", e);
            }
            let _ = event_tx.send(HubEvent::Disconnected);
        })
    }

    fn run(
        address: &str,
        access_token: &str,
        event_tx: &mpsc::UnboundedSender<HubEvent>,
    ) -> Result<(), HubError> {
        let url = websocket_url(address)?;
        info!("Connecting to hub socket at {}...", url);

        let (mut socket, _response) =
            tungstenite::connect(url.as_str()).map_err(|e| HubError::Transport(e.to_string()))?;
        let mut session = SocketSession::new(access_token);

        loop {
            let message = socket
                .read()
                .map_err(|e| HubError::Transport(e.to_string()))?;

            match message {
                Message::Text(text) => {
                    let step = match session.handle(text.as_str()) {
                        Ok(step) => step,
                        Err(e) => {
                            // One bad frame shouldn't kill the feed
                            warn!("Skipping hub frame: {}", e);
                            continue;
                        }
                    };
                    for reply in step.replies {
                        socket
                            .send(Message::Text(reply.into()))
                            .map_err(|e| HubError::Transport(e.to_string()))?;
                    }
                    for event in step.events {
                        if event_tx.send(event).is_err() {
                            debug!("Event receiver dropped, closing hub socket");
                            let _ = socket.close(None);
                            return Ok(());
                        }
                    }
                    if step.done {
                        let _ = socket.close(None);
                        return Ok(());
                    }
                }
                Message::Close(_) => {
                    info!("Hub socket closed by server");
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}
