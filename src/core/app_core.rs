use crate::catalog::EntityCatalog;
use crate::config::Config;
use crate::core::events::{scroll_update, RenderUpdate, SurfaceEvent, WidgetView};
use crate::data::{is_synthetic_id, Patch, Position, Size, UiSettings, WidgetPatch};
use crate::dispatcher::{ActionDispatcher, Dispatch, Gesture};
use crate::hub::websocket::HubEvent;
use crate::hub::HubApi;
use crate::notify::{EventLog, Toast};
use crate::persistence::BackendSelection;
use crate::store::WidgetStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Core application state
///
/// AppCore owns everything the event loop mutates: the entity catalog, the
/// widget store and the action dispatcher. Surface events, hub events and
/// timers all funnel through it; nothing else touches the collection.
pub struct AppCore {
    /// Application configuration
    pub config: Config,

    /// Live entity list from the hub
    pub catalog: EntityCatalog,

    /// Widget collection and its backend
    pub store: WidgetStore,

    /// Runs tap/hold actions
    pub dispatcher: ActionDispatcher,

    /// Recent notifications, newest first
    pub event_log: EventLog,

    /// Application running flag
    pub running: bool,

    /// Live state feed is up (state polling pauses while it is)
    pub live_connected: bool,

    hub: Arc<dyn HubApi>,

    /// Pending state refresh requested by an action
    refresh_at: Option<Instant>,

    /// Last state fetch outcome, so a down hub is reported once
    hub_reachable: Option<bool>,
}

impl AppCore {
    pub fn new(config: Config, hub: Arc<dyn HubApi>, selection: BackendSelection) -> Self {
        let store = WidgetStore::new(selection, config.store_settings());
        let event_log = EventLog::new(config.ui.event_log_size);
        Self {
            config,
            catalog: EntityCatalog::new(),
            store,
            dispatcher: ActionDispatcher::new(hub.clone()),
            event_log,
            running: true,
            live_connected: false,
            hub,
            refresh_at: None,
            hub_reachable: None,
        }
    }

    /// Fetch entities, then load the layout against them
    pub async fn load(&mut self) -> Vec<RenderUpdate> {
        let mut updates = Vec::new();
        self.fetch_states(&mut updates).await;
        self.store.load(&self.catalog).await;
        updates.push(self.snapshot());
        self.drain_toasts(&mut updates);
        updates
    }

    // ---- rendering ----

    pub fn widget_view(&self, id: &str) -> Option<WidgetView> {
        let widget = self.store.get(id)?;
        Some(WidgetView::build(
            widget,
            self.catalog.get(id),
            self.store.ui(),
            self.store.size_of(widget),
            self.store.is_unknown(id),
        ))
    }

    fn widget_update(&self, id: &str) -> Option<RenderUpdate> {
        self.widget_view(id).map(RenderUpdate::Widget)
    }

    pub fn snapshot(&self) -> RenderUpdate {
        RenderUpdate::Snapshot {
            widgets: self
                .store
                .widgets()
                .keys()
                .filter_map(|id| self.widget_view(id))
                .collect(),
            ui: self.store.ui().clone(),
            backend: self.store.backend_kind(),
            degraded: self.store.is_degraded(),
        }
    }

    /// Move store toasts into the update stream and the event log
    fn drain_toasts(&mut self, updates: &mut Vec<RenderUpdate>) {
        for toast in self.store.take_toasts() {
            self.push_toast(toast, updates);
        }
    }

    fn push_toast(&mut self, toast: Toast, updates: &mut Vec<RenderUpdate>) {
        let toast = toast.with_duration(self.config.ui.toast_duration_ms);
        self.event_log.record(&toast);
        updates.push(RenderUpdate::Toast(toast));
    }

    // ---- hub state ----

    async fn fetch_states(&mut self, updates: &mut Vec<RenderUpdate>) -> bool {
        match self.hub.get_states().await {
            Ok(states) => {
                self.catalog.update_states(&states);
                if self.hub_reachable != Some(true) {
                    info!("Hub reachable, {} entities", self.catalog.len());
                }
                self.hub_reachable = Some(true);
                true
            }
            Err(e) => {
                if self.hub_reachable != Some(false) {
                    warn!("Fetching entity states failed: {}", e);
                    let message = if e.is_auth() {
                        "Hub rejected the access token".to_string()
                    } else {
                        format!("Hub unreachable: {}", e)
                    };
                    self.push_toast(Toast::warning(message), updates);
                } else {
                    debug!("Entity state fetch still failing: {}", e);
                }
                self.hub_reachable = Some(false);
                false
            }
        }
    }

    /// Re-read every entity state and re-render what changed
    pub async fn refresh_entities(&mut self) -> Vec<RenderUpdate> {
        let mut updates = Vec::new();
        if !self.fetch_states(&mut updates).await {
            return updates;
        }
        if self.store.resolve_synthetic_ids(&self.catalog) > 0 {
            self.store.refresh_states(&self.catalog);
            updates.push(self.snapshot());
            return updates;
        }
        self.store.refresh_states(&self.catalog);
        let ids: Vec<String> = self.store.widgets().keys().cloned().collect();
        updates.extend(ids.iter().filter_map(|id| self.widget_update(id)));
        updates
    }

    pub fn handle_hub_event(&mut self, event: HubEvent) -> Vec<RenderUpdate> {
        let mut updates = Vec::new();
        match event {
            HubEvent::Connected => {
                info!("Live state feed connected");
                self.live_connected = true;
            }
            HubEvent::AuthFailed(message) => {
                warn!("Live state feed rejected the token: {}", message);
                self.live_connected = false;
                self.push_toast(
                    Toast::warning("Hub rejected the access token; live updates are off"),
                    &mut updates,
                );
            }
            HubEvent::StateChanged {
                entity_id,
                new_state,
            } => {
                let known_before = self.catalog.contains(&entity_id);
                self.catalog.apply_state(&entity_id, new_state.as_ref());
                let known_now = self.catalog.contains(&entity_id);

                if !known_before && known_now && self.store.resolve_synthetic_ids(&self.catalog) > 0 {
                    self.store.refresh_states(&self.catalog);
                    updates.push(self.snapshot());
                    return updates;
                }
                for id in self.store.refresh_states(&self.catalog) {
                    if id != entity_id {
                        updates.extend(self.widget_update(&id));
                    }
                }
                updates.extend(self.widget_update(&entity_id));
            }
            HubEvent::Disconnected => {
                if self.live_connected {
                    warn!("Live state feed lost, polling every {}s", self.config.hub.poll_interval_secs);
                }
                self.live_connected = false;
            }
        }
        updates
    }

    // ---- surface events ----

    pub async fn handle_surface_event(&mut self, event: SurfaceEvent, now: Instant) -> Vec<RenderUpdate> {
        let mut updates = Vec::new();
        match event {
            SurfaceEvent::Dropped {
                entity_id,
                x,
                y,
                width,
                height,
            } => self.place(entity_id, x, y, width.zip(height), &mut updates).await,
            SurfaceEvent::KeyResolved {
                synthetic,
                entity_id,
            } => {
                if self.store.migrate_synthetic(&synthetic, &entity_id) {
                    self.store.refresh_states(&self.catalog);
                    updates.push(RenderUpdate::removed(synthetic));
                    updates.extend(self.widget_update(&entity_id));
                }
            }
            SurfaceEvent::Moved { id, x, y } => match Position::new(x, y) {
                Some(position) => {
                    if self.store.notify_change(&id, WidgetPatch::position(position), now) {
                        updates.extend(self.widget_update(&id));
                    }
                }
                None => debug!("Ignoring non-finite move for {}", id),
            },
            SurfaceEvent::Resized { id, width, height } => match Size::new(width, height) {
                Some(size) => {
                    if self.store.notify_change(&id, WidgetPatch::size(size), now) {
                        updates.extend(self.widget_update(&id));
                    }
                }
                None => debug!("Ignoring invalid size for {}", id),
            },
            SurfaceEvent::GestureEnd { id } => {
                self.store.end_gesture(&id).await;
            }
            SurfaceEvent::Removed { id } => {
                if self.store.remove(&id).await {
                    updates.push(RenderUpdate::removed(id));
                }
            }
            SurfaceEvent::Tap { id } => self.run_gesture(&id, Gesture::Tap, now, &mut updates).await,
            SurfaceEvent::Hold { id } => self.run_gesture(&id, Gesture::Hold, now, &mut updates).await,
            SurfaceEvent::Edit { id, patch } => {
                if self.store.upsert(&id, patch).await {
                    updates.extend(self.widget_update(&id));
                }
            }
            SurfaceEvent::Ui { settings } => self.update_ui(settings, now, &mut updates).await,
            SurfaceEvent::Scroll { x, y } => match scroll_update(x, y) {
                Some(settings) => self.update_ui(settings, now, &mut updates).await,
                None => debug!("Ignoring non-finite scroll"),
            },
            SurfaceEvent::Refresh => updates.extend(self.refresh_entities().await),
            SurfaceEvent::Snapshot => updates.push(self.snapshot()),
        }
        self.drain_toasts(&mut updates);
        updates
    }

    /// Place an entity on the canvas (drop from the palette, or the CLI)
    async fn place(
        &mut self,
        id: String,
        x: f64,
        y: f64,
        size: Option<(f64, f64)>,
        updates: &mut Vec<RenderUpdate>,
    ) {
        let Some(position) = Position::new(x, y) else {
            warn!("Dropped {} at a non-finite position, ignoring", id);
            return;
        };
        let mut patch = WidgetPatch::position(position);
        if let Some(size) = size.and_then(|(w, h)| Size::new(w, h)) {
            patch.size = Patch::Set(size);
        }
        if !self.store.upsert(&id, patch).await {
            return;
        }

        // A palette copy the catalog already knows resolves right away
        let resolved = if is_synthetic_id(&id) {
            self.catalog.resolve_synthetic(&id).map(str::to_string)
        } else {
            None
        };
        match resolved {
            Some(entity_id) if self.store.migrate_synthetic(&id, &entity_id) => {
                self.store.refresh_states(&self.catalog);
                updates.extend(self.widget_update(&entity_id));
            }
            _ => {
                self.store.refresh_states(&self.catalog);
                updates.extend(self.widget_update(&id));
            }
        }
    }

    async fn run_gesture(&mut self, id: &str, gesture: Gesture, now: Instant, updates: &mut Vec<RenderUpdate>) {
        let Some(widget) = self.store.get(id).cloned() else {
            debug!("{:?} on unknown widget {}", gesture, id);
            return;
        };
        let dispatch = self.dispatcher.dispatch_gesture(&widget, gesture).await;
        self.apply_dispatch(dispatch, now, updates);
    }

    fn apply_dispatch(&mut self, dispatch: Dispatch, now: Instant, updates: &mut Vec<RenderUpdate>) {
        if let Some(url) = dispatch.open_url {
            updates.push(RenderUpdate::open_url(url));
        }
        if let Some(toast) = dispatch.toast {
            self.push_toast(toast, updates);
        }
        if let Some(delay) = dispatch.refresh_after {
            self.refresh_at = Some(now + delay);
        }
    }

    async fn update_ui(&mut self, settings: UiSettings, now: Instant, updates: &mut Vec<RenderUpdate>) {
        let relabel = settings.labels_visible.is_some();
        if self.store.update_ui(settings, now).await && relabel {
            updates.push(self.snapshot());
        }
    }

    // ---- timers ----

    /// Earliest moment `on_timer` has work
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.store.next_deadline(), self.refresh_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub async fn on_timer(&mut self, now: Instant) -> Vec<RenderUpdate> {
        let mut updates = Vec::new();
        self.store.flush_due(now).await;
        if self.refresh_at.is_some_and(|at| at <= now) {
            self.refresh_at = None;
            updates.extend(self.refresh_entities().await);
        }
        self.drain_toasts(&mut updates);
        updates
    }

    /// Pick up edits made on other devices
    pub async fn poll_remote(&mut self) -> Vec<RenderUpdate> {
        let changes = self.store.poll_remote().await;
        let mut updates = Vec::new();
        if changes.is_empty() {
            return updates;
        }
        self.store.refresh_states(&self.catalog);
        updates.extend(changes.removed.into_iter().map(RenderUpdate::removed));
        updates.extend(changes.changed.iter().filter_map(|id| self.widget_update(id)));
        updates
    }

    /// Write out everything still pending
    pub async fn shutdown(&mut self) -> Vec<RenderUpdate> {
        let written = self.store.flush_all().await;
        if written > 0 {
            info!("Flushed {} pending writes on shutdown", written);
        }
        self.running = false;
        let mut updates = Vec::new();
        self.drain_toasts(&mut updates);
        updates
    }

    // ---- event loop ----

    /// Serve the surface protocol until the input closes
    ///
    /// `hub_events` is the live state feed; while it is absent or
    /// disconnected, states are polled instead.
    pub async fn run<R, W>(
        &mut self,
        input: R,
        output: &mut W,
        mut hub_events: Option<mpsc::UnboundedReceiver<HubEvent>>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();

        let state_period = Duration::from_secs(self.config.hub.poll_interval_secs.max(1));
        let mut state_poll =
            tokio::time::interval_at(tokio::time::Instant::now() + state_period, state_period);
        state_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let remote_period = Duration::from_secs(self.config.cloud.poll_interval_secs.max(1));
        let mut remote_poll =
            tokio::time::interval_at(tokio::time::Instant::now() + remote_period, remote_period);
        remote_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running {
            let wakeup = self.next_wakeup();
            let updates = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match SurfaceEvent::parse(&line) {
                            Ok(event) => self.handle_surface_event(event, Instant::now()).await,
                            Err(e) => {
                                warn!("Ignoring malformed surface line {:?}: {}", line, e);
                                continue;
                            }
                        }
                    }
                    Ok(None) => {
                        info!("Surface input closed");
                        self.shutdown().await
                    }
                    Err(e) => {
                        error!("Reading surface input failed: {}", e);
                        self.shutdown().await
                    }
                },
                event = async {
                    match hub_events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Some(event) => self.handle_hub_event(event),
                    None => {
                        debug!("Hub event channel closed");
                        hub_events = None;
                        self.live_connected = false;
                        continue;
                    }
                },
                _ = async {
                    match wakeup {
                        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                        None => std::future::pending().await,
                    }
                } => self.on_timer(Instant::now()).await,
                _ = state_poll.tick() => {
                    if self.live_connected {
                        continue;
                    }
                    self.refresh_entities().await
                }
                _ = remote_poll.tick(), if self.store.is_shared() => self.poll_remote().await,
            };
            write_updates(output, &updates).await?;
        }
        Ok(())
    }
}

/// One JSON line per update
pub async fn write_updates<W: AsyncWrite + Unpin>(output: &mut W, updates: &[RenderUpdate]) -> Result<()> {
    for update in updates {
        let line = update.to_line().context("Failed to encode render update")?;
        output
            .write_all(line.as_bytes())
            .await
            .context("Failed to write render update")?;
        output.write_all(b"\n").await.context("Failed to write render update")?;
    }
    output.flush().await.context("Failed to flush render updates")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ActionDescriptor;
    use crate::hub::{HubEntityState, HubError, HubServiceDomain};
    use crate::persistence::{LocalBackend, LocalCache, WidgetBackend};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct FakeHub {
        states: Mutex<Vec<HubEntityState>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHub {
        fn with(ids: &[(&str, &str)]) -> Self {
            let states = ids
                .iter()
                .map(|(id, state)| entity(id, state))
                .collect();
            Self {
                states: Mutex::new(states),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    fn entity(id: &str, state: &str) -> HubEntityState {
        serde_json::from_value(json!({"entity_id": id, "state": state})).unwrap()
    }

    #[async_trait]
    impl HubApi for FakeHub {
        fn address(&self) -> &str {
            "http://hub.local:8123"
        }

        async fn get_states(&self) -> Result<Vec<HubEntityState>, HubError> {
            Ok(self.states.lock().unwrap().clone())
        }

        async fn get_services(&self) -> Result<Vec<HubServiceDomain>, HubError> {
            Ok(Vec::new())
        }

        async fn call_service(&self, domain: &str, service: &str, _data: Value) -> Result<Value, HubError> {
            self.calls.lock().unwrap().push(format!("{}.{}", domain, service));
            Ok(Value::Null)
        }
    }

    async fn app_with(hub: Arc<FakeHub>) -> (AppCore, Arc<LocalBackend>) {
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let mut app = AppCore::new(Config::default(), hub, BackendSelection::local(local.clone()));
        app.load().await;
        (app, local)
    }

    #[tokio::test]
    async fn test_drop_drag_release_persists_final_position() {
        let hub = Arc::new(FakeHub::with(&[("sensor.front_door", "off")]));
        let (mut app, local) = app_with(hub).await;
        let start = Instant::now();

        let updates = app
            .handle_surface_event(SurfaceEvent::dropped("sensor.front_door", 120.0, 340.0), start)
            .await;
        assert!(matches!(&updates[0], RenderUpdate::Widget(view) if view.id == "sensor.front_door"));

        for i in 0..50u32 {
            app.handle_surface_event(SurfaceEvent::moved("sensor.front_door", f64::from(i), 1.0), start)
                .await;
        }
        app.handle_surface_event(SurfaceEvent::gesture_end("sensor.front_door"), start)
            .await;
        assert!(!app.store.has_pending());

        let stored = local.load().await.unwrap();
        assert_eq!(stored["sensor.front_door"].position, Position::new(49.0, 1.0));
    }

    #[tokio::test]
    async fn test_synthetic_drop_resolves_against_catalog() {
        let hub = Arc::new(FakeHub::with(&[("light.hall", "on")]));
        let (mut app, _) = app_with(hub).await;
        let token = crate::data::synthetic_id("light.hall");

        let updates = app
            .handle_surface_event(SurfaceEvent::dropped(token.clone(), 5.0, 5.0), Instant::now())
            .await;
        assert!(app.store.get(&token).is_none());
        assert!(app.store.get("light.hall").is_some());
        assert!(matches!(&updates[0], RenderUpdate::Widget(view) if view.id == "light.hall"));
    }

    #[tokio::test]
    async fn test_tap_toggle_schedules_refresh() {
        let hub = Arc::new(FakeHub::with(&[("light.kitchen", "off")]));
        let (mut app, _) = app_with(hub.clone()).await;
        let start = Instant::now();
        app.handle_surface_event(SurfaceEvent::dropped("light.kitchen", 1.0, 1.0), start)
            .await;
        app.handle_surface_event(
            SurfaceEvent::Edit {
                id: "light.kitchen".into(),
                patch: WidgetPatch {
                    tap_action: Patch::Set(ActionDescriptor::Toggle),
                    hold_action: Patch::Set(ActionDescriptor::MoreInfo),
                    ..WidgetPatch::default()
                },
            },
            start,
        )
        .await;

        app.handle_surface_event(SurfaceEvent::Tap { id: "light.kitchen".into() }, start)
            .await;
        assert_eq!(hub.calls.lock().unwrap().clone(), vec!["light.toggle".to_string()]);
        assert_eq!(app.next_wakeup(), Some(start + crate::dispatcher::TOGGLE_REFRESH_DELAY));

        *hub.states.lock().unwrap() = vec![entity("light.kitchen", "on")];
        let updates = app.on_timer(start + Duration::from_secs(1)).await;
        assert!(updates.iter().any(
            |u| matches!(u, RenderUpdate::Widget(view) if view.color == "#FFC107")
        ));

        let updates = app
            .handle_surface_event(SurfaceEvent::Hold { id: "light.kitchen".into() }, start)
            .await;
        assert_eq!(
            updates,
            vec![RenderUpdate::open_url("http://hub.local:8123/config/entities/light.kitchen")]
        );
    }

    #[tokio::test]
    async fn test_state_changed_marks_widget_unknown() {
        let hub = Arc::new(FakeHub::with(&[("sensor.temp", "21")]));
        let (mut app, _) = app_with(hub).await;
        app.handle_surface_event(SurfaceEvent::dropped("sensor.temp", 1.0, 1.0), Instant::now())
            .await;
        assert!(!app.store.is_unknown("sensor.temp"));

        let updates = app.handle_hub_event(HubEvent::StateChanged {
            entity_id: "sensor.temp".into(),
            new_state: None,
        });
        assert!(app.store.is_unknown("sensor.temp"));
        assert!(matches!(&updates[0], RenderUpdate::Widget(view) if view.unknown));

        let updates = app.handle_hub_event(HubEvent::StateChanged {
            entity_id: "sensor.temp".into(),
            new_state: Some(entity("sensor.temp", "22")),
        });
        assert!(matches!(&updates[0], RenderUpdate::Widget(view) if view.value.as_deref() == Some("22")));
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_polling() {
        let hub = Arc::new(FakeHub::with(&[]));
        let (mut app, _) = app_with(hub).await;
        app.handle_hub_event(HubEvent::Connected);
        assert!(app.live_connected);

        let updates = app.handle_hub_event(HubEvent::AuthFailed("bad token".into()));
        assert!(!app.live_connected);
        assert!(matches!(&updates[0], RenderUpdate::Toast(_)));
        assert_eq!(app.event_log.len(), 1);
    }

    #[tokio::test]
    async fn test_run_flushes_pending_writes_on_eof() {
        let hub = Arc::new(FakeHub::with(&[("light.a", "on")]));
        let (mut app, local) = app_with(hub).await;

        let input = concat!(
            "{\"type\":\"dropped\",\"entity_id\":\"light.a\",\"x\":1,\"y\":2}\n",
            "garbage\n",
            "{\"type\":\"moved\",\"id\":\"light.a\",\"x\":7,\"y\":8}\n",
        );
        let mut output = Vec::new();
        app.run(tokio::io::BufReader::new(input.as_bytes()), &mut output, None)
            .await
            .unwrap();

        assert!(!app.running);
        let stored = local.load().await.unwrap();
        assert_eq!(stored["light.a"].position, Position::new(7.0, 8.0));

        let text = String::from_utf8(output).unwrap();
        let first: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "widget");
        assert_eq!(first["id"], "light.a");
    }
}
