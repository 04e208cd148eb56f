//! Widget store - the authoritative widget collection
//!
//! Owns the in-memory collection, the debounce scheduler and the active
//! backend. Every mutation goes through here; backend failures become log
//! lines, toasts and a one-way fallback to the local cache, never errors.

pub mod migration;
pub mod scheduler;

pub use scheduler::CommitScheduler;

use crate::catalog::EntityCatalog;
use crate::data::{Size, UiSettings, Widget, WidgetPatch};
use crate::notify::Toast;
use crate::persistence::{BackendError, BackendKind, BackendSelection, Collection, WidgetBackend};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Timing and defaults from `[store]`
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub debounce: Duration,
    pub ui_debounce: Duration,
    pub default_size: Size,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(600),
            ui_debounce: Duration::from_millis(1000),
            default_size: Size {
                width: 80.0,
                height: 40.0,
            },
        }
    }
}

/// One backend write
enum Write {
    Upsert(Widget),
    Remove(String),
    Collection { widgets: Collection, explicit: bool },
    Ui(UiSettings),
}

impl Write {
    fn describe(&self) -> String {
        match self {
            Write::Upsert(widget) => format!("save {}", widget.id),
            Write::Remove(id) => format!("remove {}", id),
            Write::Collection { widgets, .. } => format!("save layout ({} widgets)", widgets.len()),
            Write::Ui(_) => "save UI settings".to_string(),
        }
    }

    async fn run(&self, backend: &dyn WidgetBackend) -> Result<(), BackendError> {
        match self {
            Write::Upsert(widget) => backend.upsert(widget).await,
            Write::Remove(id) => backend.remove(id).await,
            Write::Collection { widgets, explicit } => backend.save_collection(widgets, *explicit).await,
            Write::Ui(ui) => backend.save_ui(ui).await,
        }
    }
}

/// Ids touched by a remote snapshot
#[derive(Debug, Default, PartialEq)]
pub struct RemoteChanges {
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl RemoteChanges {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

pub struct WidgetStore {
    widgets: Collection,
    /// Widgets whose entity the catalog does not know
    unknown: BTreeSet<String>,
    ui: UiSettings,
    backend: Arc<dyn WidgetBackend>,
    fallback: Option<Arc<dyn WidgetBackend>>,
    degraded: bool,
    scheduler: CommitScheduler,
    ui_deadline: Option<Instant>,
    settings: StoreSettings,
    collection_dirty: bool,
    /// Set when the user removed the last widget; allows an empty collection save
    intentionally_empty: bool,
    toasts: Vec<Toast>,
}

impl WidgetStore {
    pub fn new(selection: BackendSelection, settings: StoreSettings) -> Self {
        let mut toasts = Vec::new();
        match &selection.cloud_error {
            Some(e) if e.is_auth() => {
                toasts.push(Toast::warning("Cloud sign-in failed; changes are saved on this device only"))
            }
            Some(_) => toasts.push(Toast::warning("Cloud storage unavailable; using local cache")),
            None => {}
        }

        Self {
            widgets: Collection::new(),
            unknown: BTreeSet::new(),
            ui: UiSettings::default(),
            backend: selection.active,
            fallback: selection.fallback,
            degraded: false,
            scheduler: CommitScheduler::new(settings.debounce),
            ui_deadline: None,
            settings,
            collection_dirty: false,
            intentionally_empty: false,
            toasts,
        }
    }

    // ---- reads ----

    pub fn widgets(&self) -> &Collection {
        &self.widgets
    }

    pub fn get(&self, id: &str) -> Option<&Widget> {
        self.widgets.get(id)
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    pub fn is_unknown(&self, id: &str) -> bool {
        self.unknown.contains(id)
    }

    pub fn ui(&self) -> &UiSettings {
        &self.ui
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// True once a live failure moved the session to the local cache
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_shared(&self) -> bool {
        self.backend.is_shared()
    }

    /// Stored size, or the template default
    pub fn size_of(&self, widget: &Widget) -> Size {
        widget.size.unwrap_or(self.settings.default_size)
    }

    pub fn has_pending(&self) -> bool {
        !self.scheduler.is_empty() || self.ui_deadline.is_some() || self.collection_dirty
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.scheduler.is_pending(id)
    }

    /// Earliest moment `flush_due` has work
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.scheduler.next_deadline(), self.ui_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn take_toasts(&mut self) -> Vec<Toast> {
        std::mem::take(&mut self.toasts)
    }

    // ---- loading ----

    /// Replace the in-memory collection from the backend
    ///
    /// Read failures give an empty collection and a warning. Synthetic ids
    /// the catalog can resolve are migrated on the way in.
    pub async fn load(&mut self, catalog: &EntityCatalog) -> usize {
        let backend = self.backend.clone();
        let widgets = match backend.load().await {
            Ok(widgets) => widgets,
            Err(e) => {
                warn!("Loading widgets from {} storage failed: {}", backend.kind(), e);
                match self.fall_back() {
                    Some(local) => local.load().await.unwrap_or_else(|e| {
                        warn!("Local cache unreadable too, starting empty: {}", e);
                        Collection::new()
                    }),
                    None => {
                        self.toasts.push(Toast::warning("Could not read saved layout"));
                        Collection::new()
                    }
                }
            }
        };

        self.widgets = widgets
            .into_iter()
            .map(|(id, mut widget)| {
                widget.id = id.clone();
                (id, widget)
            })
            .collect();
        self.intentionally_empty = false;

        let backend = self.backend.clone();
        self.ui = backend.load_ui().await.unwrap_or_else(|e| {
            warn!("Loading UI settings failed: {}", e);
            UiSettings::default()
        });

        let migrated = self.resolve_synthetic_ids(catalog);
        if migrated > 0 {
            info!("Resolved {} palette copies while loading", migrated);
        }
        self.refresh_states(catalog);

        info!(
            "Loaded {} widgets from {} storage",
            self.widgets.len(),
            self.backend.kind()
        );
        self.widgets.len()
    }

    // ---- mutations ----

    /// Merge `patch` into widget `id`, creating it if needed, and write it
    /// through. Returns false when nothing changed (no write issued).
    pub async fn upsert(&mut self, id: &str, patch: WidgetPatch) -> bool {
        if id.is_empty() {
            warn!("Ignoring upsert with an empty widget id");
            return false;
        }
        let is_new = !self.widgets.contains_key(id);
        let widget = self
            .widgets
            .entry(id.to_string())
            .or_insert_with(|| Widget::new(id));
        let changed = patch.apply(widget);
        if !is_new && !changed {
            debug!("Upsert for {} changed nothing", id);
            return false;
        }
        let record = widget.clone();

        // A direct write supersedes any pending debounced one
        self.scheduler.cancel(id);
        self.intentionally_empty = false;
        if is_new {
            info!("Placed widget {}", id);
        }
        self.commit(Write::Upsert(record)).await;
        true
    }

    pub async fn remove(&mut self, id: &str) -> bool {
        self.scheduler.cancel(id);
        if self.widgets.remove(id).is_none() {
            debug!("Remove for unknown widget {}", id);
            return false;
        }
        self.unknown.remove(id);
        if self.widgets.is_empty() {
            self.intentionally_empty = true;
        }
        info!("Removed widget {}", id);
        self.commit(Write::Remove(id.to_string())).await;
        true
    }

    /// Apply a move/resize notification in memory and schedule its write
    ///
    /// Notifications for widgets that are not in the collection are ignored.
    pub fn notify_change(&mut self, id: &str, patch: WidgetPatch, now: Instant) -> bool {
        let Some(widget) = self.widgets.get_mut(id) else {
            debug!("Ignoring change for unknown widget {}", id);
            return false;
        };
        if !patch.apply(widget) {
            return false;
        }
        self.scheduler.notify(id, now);
        true
    }

    /// Gesture finished: write the final value now, superseding the timer
    pub async fn end_gesture(&mut self, id: &str) -> bool {
        if !self.scheduler.flush_now(id) {
            return false;
        }
        self.write_record(id).await
    }

    /// Perform every write whose quiet window has passed
    pub async fn flush_due(&mut self, now: Instant) -> usize {
        let mut written = 0;
        for id in self.scheduler.poll_due(now) {
            if self.write_record(&id).await {
                written += 1;
            }
        }
        if self.ui_deadline.is_some_and(|deadline| deadline <= now) {
            self.ui_deadline = None;
            self.commit(Write::Ui(self.ui.clone())).await;
            written += 1;
        }
        if self.collection_dirty {
            self.save_collection().await;
            written += 1;
        }
        written
    }

    /// Write everything pending regardless of deadlines (shutdown)
    pub async fn flush_all(&mut self) -> usize {
        let mut written = 0;
        for id in self.scheduler.drain() {
            if self.write_record(&id).await {
                written += 1;
            }
        }
        if self.ui_deadline.take().is_some() {
            self.commit(Write::Ui(self.ui.clone())).await;
            written += 1;
        }
        if self.collection_dirty {
            self.save_collection().await;
            written += 1;
        }
        written
    }

    async fn write_record(&mut self, id: &str) -> bool {
        // Removed since the notification: nothing to write
        let Some(widget) = self.widgets.get(id).cloned() else {
            return false;
        };
        self.commit(Write::Upsert(widget)).await
    }

    async fn save_collection(&mut self) {
        self.collection_dirty = false;
        let write = Write::Collection {
            widgets: self.widgets.clone(),
            explicit: self.intentionally_empty,
        };
        self.commit(write).await;
    }

    // ---- synthetic ids ----

    /// Fold a palette copy into its entity's record and schedule a layout save
    pub fn migrate_synthetic(&mut self, synthetic: &str, canonical: &str) -> bool {
        if !migration::migrate(&mut self.widgets, synthetic, canonical) {
            return false;
        }
        self.scheduler.rekey(synthetic, canonical);
        self.unknown.remove(synthetic);
        self.collection_dirty = true;
        self.intentionally_empty = false;
        info!("Migrated widget {} -> {}", synthetic, canonical);
        true
    }

    /// Migrate every synthetic id the catalog can resolve; the rest stay
    pub fn resolve_synthetic_ids(&mut self, catalog: &EntityCatalog) -> usize {
        let mut migrated = 0;
        for token in migration::synthetic_ids(&self.widgets) {
            match catalog.resolve_synthetic(&token).map(str::to_string) {
                Some(entity_id) => {
                    if self.migrate_synthetic(&token, &entity_id) {
                        migrated += 1;
                    }
                }
                None => debug!("Synthetic id {} not resolvable yet", token),
            }
        }
        migrated
    }

    // ---- entity state ----

    /// Recompute which widgets point at entities the hub doesn't report
    pub fn refresh_states(&mut self, catalog: &EntityCatalog) -> Vec<String> {
        if !catalog.is_loaded() {
            return Vec::new();
        }
        let unknown: BTreeSet<String> = self
            .widgets
            .keys()
            .filter(|id| !catalog.contains(id))
            .cloned()
            .collect();
        let flipped: Vec<String> = unknown
            .symmetric_difference(&self.unknown)
            .cloned()
            .collect();
        for id in unknown.difference(&self.unknown) {
            warn!("Widget {} has no matching entity; state unknown", id);
        }
        self.unknown = unknown;
        flipped
    }

    // ---- remote updates ----

    /// Re-read a shared backend and take its state; a failed read is skipped
    pub async fn poll_remote(&mut self) -> RemoteChanges {
        if !self.backend.is_shared() {
            return RemoteChanges::default();
        }
        let backend = self.backend.clone();
        match backend.load().await {
            Ok(snapshot) => self.apply_remote_snapshot(snapshot),
            Err(e) => {
                debug!("Remote poll on {} storage failed: {}", backend.kind(), e);
                RemoteChanges::default()
            }
        }
    }

    /// Take a snapshot from a shared backend; remote wins over local state
    /// except for widgets with a debounced write still pending, whose local
    /// record is newer than anything the backend holds
    pub fn apply_remote_snapshot(&mut self, snapshot: Collection) -> RemoteChanges {
        let mut snapshot: Collection = snapshot
            .into_iter()
            .map(|(id, mut widget)| {
                widget.id = id.clone();
                (id, widget)
            })
            .collect();
        for (id, widget) in &self.widgets {
            if self.scheduler.is_pending(id) {
                snapshot.insert(id.clone(), widget.clone());
            }
        }

        let mut changes = RemoteChanges::default();
        for (id, widget) in &snapshot {
            if self.widgets.get(id) != Some(widget) {
                changes.changed.push(id.clone());
            }
        }
        for id in self.widgets.keys() {
            if !snapshot.contains_key(id) {
                changes.removed.push(id.clone());
            }
        }
        if changes.is_empty() {
            return changes;
        }

        debug!(
            "Remote snapshot: {} changed, {} removed",
            changes.changed.len(),
            changes.removed.len()
        );
        for id in &changes.removed {
            self.scheduler.cancel(id);
            self.unknown.remove(id);
        }
        self.widgets = snapshot;
        changes
    }

    // ---- UI settings ----

    /// Merge a UI settings change. Scroll and pan are debounced, toggles and
    /// scale are written immediately.
    pub async fn update_ui(&mut self, update: UiSettings, now: Instant) -> bool {
        if !self.ui.merge(&update) {
            return false;
        }
        let viewport_only = update.labels_visible.is_none()
            && update.sidebar_visible.is_none()
            && update.scale.is_none();
        if viewport_only {
            self.ui_deadline = Some(now + self.settings.ui_debounce);
        } else {
            self.ui_deadline = None;
            self.commit(Write::Ui(self.ui.clone())).await;
        }
        true
    }

    // ---- backend failure handling ----

    /// Switch to the local tier for the rest of the session
    fn fall_back(&mut self) -> Option<Arc<dyn WidgetBackend>> {
        let local = self.fallback.take()?;
        warn!(
            "Falling back from {} storage to the local cache for this session",
            self.backend.kind()
        );
        self.backend = local.clone();
        self.degraded = true;
        Some(local)
    }

    async fn commit(&mut self, write: Write) -> bool {
        let backend = self.backend.clone();
        let err = match write.run(backend.as_ref()).await {
            Ok(()) => return true,
            Err(e) => e,
        };
        error!("{} failed on {} storage: {}", write.describe(), backend.kind(), err);

        let Some(local) = self.fall_back() else {
            self.toasts
                .push(Toast::error(format!("Could not {}: {}", write.describe(), err)));
            return false;
        };

        if err.is_auth() {
            self.toasts
                .push(Toast::warning("Cloud sign-in expired; saving on this device only"));
        } else {
            self.toasts
                .push(Toast::warning("Cloud storage unavailable; saving on this device only"));
        }

        // The local tier never saw the cloud-era edits; hand it the full state
        let retry = Write::Collection {
            widgets: self.widgets.clone(),
            explicit: self.intentionally_empty,
        };
        let mut ok = true;
        for write in [retry, Write::Ui(self.ui.clone())] {
            if let Err(e) = write.run(local.as_ref()).await {
                error!("{} failed on local cache too: {}", write.describe(), e);
                self.toasts
                    .push(Toast::error(format!("Could not {}: {}", write.describe(), e)));
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_id, Patch, Position};
    use crate::hub::HubEntityState;
    use crate::persistence::document_store::MemoryDocumentStore;
    use crate::persistence::{select_with_store, LocalBackend, LocalCache};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory backend that records every call
    #[derive(Default)]
    struct RecordingBackend {
        widgets: Mutex<Collection>,
        ui: Mutex<UiSettings>,
        ops: Mutex<Vec<String>>,
        fail: std::sync::atomic::AtomicBool,
        kind: Option<BackendKind>,
    }

    impl RecordingBackend {
        fn cloud() -> Self {
            Self {
                kind: Some(BackendKind::Cloud),
                ..Self::default()
            }
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn stored(&self, id: &str) -> Option<Widget> {
            self.widgets.lock().unwrap().get(id).cloned()
        }

        fn record(&self, op: String) -> Result<(), BackendError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(BackendError::Transport("offline".into()));
            }
            self.ops.lock().unwrap().push(op);
            Ok(())
        }
    }

    #[async_trait]
    impl WidgetBackend for RecordingBackend {
        fn kind(&self) -> BackendKind {
            self.kind.unwrap_or(BackendKind::Local)
        }

        async fn load(&self) -> Result<Collection, BackendError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(BackendError::Transport("offline".into()));
            }
            Ok(self.widgets.lock().unwrap().clone())
        }

        async fn upsert(&self, widget: &Widget) -> Result<(), BackendError> {
            self.record(format!("upsert:{}", widget.id))?;
            self.widgets
                .lock()
                .unwrap()
                .insert(widget.id.clone(), widget.clone());
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<(), BackendError> {
            self.record(format!("remove:{}", id))?;
            self.widgets.lock().unwrap().remove(id);
            Ok(())
        }

        async fn save_collection(&self, widgets: &Collection, explicit: bool) -> Result<(), BackendError> {
            self.record(format!("collection:{}:{}", widgets.len(), explicit))?;
            let mut stored = self.widgets.lock().unwrap();
            if widgets.is_empty() && !explicit && !stored.is_empty() {
                return Ok(());
            }
            *stored = widgets.clone();
            Ok(())
        }

        async fn load_ui(&self) -> Result<UiSettings, BackendError> {
            Ok(self.ui.lock().unwrap().clone())
        }

        async fn save_ui(&self, ui: &UiSettings) -> Result<(), BackendError> {
            self.record("ui".to_string())?;
            *self.ui.lock().unwrap() = ui.clone();
            Ok(())
        }
    }

    fn store_on(backend: Arc<RecordingBackend>) -> WidgetStore {
        WidgetStore::new(
            BackendSelection {
                active: backend,
                fallback: None,
                cloud_error: None,
            },
            StoreSettings::default(),
        )
    }

    fn pos(x: f64, y: f64) -> WidgetPatch {
        WidgetPatch::position(Position::new(x, y).unwrap())
    }

    fn catalog_of(ids: &[&str]) -> EntityCatalog {
        let states: Vec<HubEntityState> = ids
            .iter()
            .map(|id| {
                serde_json::from_value(serde_json::json!({"entity_id": id, "state": "on"})).unwrap()
            })
            .collect();
        EntityCatalog::from_states(&states)
    }

    #[tokio::test]
    async fn test_dropped_widget_is_persisted_without_size() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());

        assert!(store.upsert("sensor.front_door", pos(120.0, 340.0)).await);
        let stored = backend.stored("sensor.front_door").unwrap();
        assert_eq!(
            serde_json::to_value(&stored).unwrap(),
            serde_json::json!({"entityName": "sensor.front_door", "position": "120 340"})
        );
        assert_eq!(stored.size, None);
        assert_eq!(store.size_of(&stored), Size::new(80.0, 40.0).unwrap());
    }

    #[tokio::test]
    async fn test_upsert_then_load_on_same_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let local = Arc::new(LocalBackend::new(LocalCache::load(&path).unwrap()));
        let mut store = WidgetStore::new(BackendSelection::local(local), StoreSettings::default());
        store.upsert("light.kitchen", pos(10.5, 20.0)).await;

        let reopened = Arc::new(LocalBackend::new(LocalCache::load(&path).unwrap()));
        let mut fresh = WidgetStore::new(BackendSelection::local(reopened), StoreSettings::default());
        assert_eq!(fresh.load(&EntityCatalog::new()).await, 1);
        assert_eq!(
            fresh.get("light.kitchen").unwrap().position,
            Position::new(10.5, 20.0)
        );
    }

    #[tokio::test]
    async fn test_unchanged_upsert_writes_nothing() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        store.upsert("light.a", pos(1.0, 1.0)).await;
        assert!(!store.upsert("light.a", pos(1.0, 1.0)).await);
        assert_eq!(backend.ops(), vec!["upsert:light.a"]);
    }

    #[tokio::test]
    async fn test_fifty_moves_and_gesture_end_write_once() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        store.upsert("light.a", pos(0.0, 0.0)).await;

        let start = Instant::now();
        for i in 0..50u32 {
            let now = start + Duration::from_millis(u64::from(i) * 2);
            assert!(store.notify_change("light.a", pos(f64::from(i), 5.0), now));
        }
        assert!(store.end_gesture("light.a").await);
        assert_eq!(store.flush_due(start + Duration::from_secs(5)).await, 0);

        assert_eq!(backend.ops(), vec!["upsert:light.a", "upsert:light.a"]);
        assert_eq!(
            backend.stored("light.a").unwrap().position,
            Position::new(49.0, 5.0)
        );
    }

    #[tokio::test]
    async fn test_rapid_resizes_store_final_size() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        store.upsert("camera.porch", pos(5.0, 5.0)).await;

        let start = Instant::now();
        for i in 0..10u32 {
            let size = Size::new(71.0 + f64::from(i), 31.0 + f64::from(i)).unwrap();
            store.notify_change("camera.porch", WidgetPatch::size(size), start + Duration::from_millis(u64::from(i)));
        }
        store.end_gesture("camera.porch").await;

        let stored = backend.stored("camera.porch").unwrap();
        assert_eq!(serde_json::to_value(stored.size).unwrap(), serde_json::json!("80 40"));
        assert_eq!(backend.ops().len(), 2);
    }

    #[tokio::test]
    async fn test_debounced_write_fires_after_quiet_window() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        store.upsert("light.a", pos(0.0, 0.0)).await;

        let start = Instant::now();
        store.notify_change("light.a", pos(3.0, 3.0), start);
        assert_eq!(store.next_deadline(), Some(start + Duration::from_millis(600)));
        assert_eq!(store.flush_due(start + Duration::from_millis(100)).await, 0);
        assert_eq!(store.flush_due(start + Duration::from_millis(600)).await, 1);
        assert!(!store.end_gesture("light.a").await);
    }

    #[tokio::test]
    async fn test_change_for_unknown_widget_ignored() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        assert!(!store.notify_change("light.ghost", pos(1.0, 1.0), Instant::now()));
        assert!(!store.has_pending());
    }

    #[tokio::test]
    async fn test_remove_sole_widget_stays_empty() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        store.upsert("sensor.a", pos(1.0, 1.0)).await;

        let start = Instant::now();
        store.notify_change("sensor.a", pos(2.0, 2.0), start);
        assert!(store.remove("sensor.a").await);
        assert!(store.is_empty());

        // The cancelled move must not resurrect the widget
        store.flush_due(start + Duration::from_secs(10)).await;
        assert!(backend.load().await.unwrap().is_empty());
        assert_eq!(backend.ops(), vec!["upsert:sensor.a", "remove:sensor.a"]);

        let mut reloaded = store_on(backend.clone());
        assert_eq!(reloaded.load(&EntityCatalog::new()).await, 0);
    }

    #[tokio::test]
    async fn test_implicit_empty_save_never_clobbers() {
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let mut seeded = Widget::new("sensor.a");
        seeded.position = Position::new(1.0, 1.0);
        local.upsert(&seeded).await.unwrap();

        // A store that never loaded has an empty collection; its layout save
        // must not wipe what is stored
        let mut store = WidgetStore::new(BackendSelection::local(local.clone()), StoreSettings::default());
        store.collection_dirty = true;
        store.flush_all().await;
        assert_eq!(local.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_migrating_twice_equals_once() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        let token = synthetic_id("sensor.front_door");
        store.upsert(&token, pos(120.0, 340.0)).await;

        assert!(store.migrate_synthetic(&token, "sensor.front_door"));
        let once = store.widgets().clone();
        assert!(!store.migrate_synthetic(&token, "sensor.front_door"));
        assert_eq!(store.widgets(), &once);

        store.flush_due(Instant::now()).await;
        assert!(backend.stored(&token).is_none());
        assert_eq!(
            backend.stored("sensor.front_door").unwrap().position,
            Position::new(120.0, 340.0)
        );
        assert_eq!(backend.ops().last().unwrap(), "collection:1:false");
    }

    #[tokio::test]
    async fn test_load_resolves_synthetic_and_marks_unknown() {
        let backend = Arc::new(RecordingBackend::default());
        let token = synthetic_id("light.hall");
        for id in [token.as_str(), "sensor.gone", "-5"] {
            let mut widget = Widget::new(id);
            widget.position = Position::new(1.0, 1.0);
            backend.widgets.lock().unwrap().insert(id.to_string(), widget);
        }

        let mut store = store_on(backend.clone());
        store.load(&catalog_of(&["light.hall"])).await;

        assert!(store.get("light.hall").is_some());
        assert!(store.get(&token).is_none());
        // Unresolvable tokens stay until a later catalog refresh
        assert!(store.get("-5").is_some());
        assert!(store.is_unknown("sensor.gone"));
        assert!(!store.is_unknown("light.hall"));
    }

    #[tokio::test]
    async fn test_empty_prefix_clears_field_everywhere() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        let set = |prefix: &str| WidgetPatch {
            value_prefix: Patch::Set(prefix.to_string()),
            ..WidgetPatch::default()
        };
        store.upsert("sensor.power", set("$")).await;
        assert!(store.upsert("sensor.power", set("")).await);

        assert_eq!(store.get("sensor.power").unwrap().value_prefix, None);
        assert_eq!(backend.stored("sensor.power").unwrap().value_prefix, None);
    }

    #[tokio::test]
    async fn test_write_failure_falls_back_to_local() {
        let cloud = Arc::new(RecordingBackend::cloud());
        let local = Arc::new(RecordingBackend::default());
        let mut store = WidgetStore::new(
            BackendSelection {
                active: cloud.clone(),
                fallback: Some(local.clone()),
                cloud_error: None,
            },
            StoreSettings::default(),
        );
        store.upsert("light.a", pos(1.0, 1.0)).await;

        cloud.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        store.upsert("light.b", pos(2.0, 2.0)).await;

        assert!(store.is_degraded());
        assert_eq!(store.backend_kind(), BackendKind::Local);
        assert!(local.stored("light.a").is_some());
        assert!(local.stored("light.b").is_some());
        assert_eq!(store.take_toasts().len(), 1);

        // Never switched back, even once the cloud recovers
        cloud.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        store.upsert("light.c", pos(3.0, 3.0)).await;
        assert!(cloud.stored("light.c").is_none());
        assert!(local.stored("light.c").is_some());
    }

    #[tokio::test]
    async fn test_read_failure_gives_empty_collection() {
        let backend = Arc::new(RecordingBackend::default());
        backend.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut store = store_on(backend);
        assert_eq!(store.load(&EntityCatalog::new()).await, 0);
        assert_eq!(store.take_toasts().len(), 1);
    }

    #[tokio::test]
    async fn test_cloud_init_copies_local_layout() {
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        for (id, x) in [("sensor.a", 1.0), ("sensor.b", 2.0)] {
            let mut widget = Widget::new(id);
            widget.position = Position::new(x, x);
            local.upsert(&widget).await.unwrap();
        }

        let docs = Arc::new(MemoryDocumentStore::new());
        let selection = select_with_store(docs.clone(), local).await;
        let mut store = WidgetStore::new(selection, StoreSettings::default());
        assert_eq!(store.backend_kind(), BackendKind::Cloud);
        assert_eq!(store.load(&EntityCatalog::new()).await, 2);

        // A second device sees the same layout
        let other = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let selection = select_with_store(docs, other).await;
        let mut second = WidgetStore::new(selection, StoreSettings::default());
        assert_eq!(second.load(&EntityCatalog::new()).await, 2);
    }

    #[tokio::test]
    async fn test_remote_snapshot_wins() {
        let backend = Arc::new(RecordingBackend::cloud());
        let mut store = store_on(backend.clone());
        store.upsert("light.a", pos(1.0, 1.0)).await;
        store.upsert("light.b", pos(2.0, 2.0)).await;

        let mut snapshot = Collection::new();
        let mut moved = Widget::new("light.a");
        moved.position = Position::new(9.0, 9.0);
        snapshot.insert("light.a".into(), moved);

        let changes = store.apply_remote_snapshot(snapshot.clone());
        assert_eq!(changes.changed, vec!["light.a".to_string()]);
        assert_eq!(changes.removed, vec!["light.b".to_string()]);
        assert_eq!(store.get("light.a").unwrap().position, Position::new(9.0, 9.0));
        assert!(store.apply_remote_snapshot(snapshot).is_empty());
    }

    #[tokio::test]
    async fn test_remote_snapshot_keeps_pending_local_writes() {
        let backend = Arc::new(RecordingBackend::cloud());
        let mut store = store_on(backend.clone());
        let start = Instant::now();
        store.upsert("light.a", pos(1.0, 1.0)).await;
        store.upsert("light.b", pos(2.0, 2.0)).await;
        assert!(store.notify_change("light.a", pos(50.0, 50.0), start));

        // Backend still holds the pre-gesture light.a; light.b moved remotely
        let mut snapshot = backend.widgets.lock().unwrap().clone();
        let mut remote_b = Widget::new("other-key");
        remote_b.position = Position::new(7.0, 7.0);
        snapshot.insert("light.b".into(), remote_b);

        let changes = store.apply_remote_snapshot(snapshot);
        assert_eq!(changes.changed, vec!["light.b".to_string()]);
        assert!(changes.removed.is_empty());
        assert_eq!(store.get("light.a").unwrap().position, Position::new(50.0, 50.0));
        assert_eq!(store.get("light.b").unwrap().id, "light.b");
        assert_eq!(store.get("light.b").unwrap().position, Position::new(7.0, 7.0));

        assert_eq!(store.flush_due(start + Duration::from_secs(1)).await, 1);
        assert_eq!(backend.stored("light.a").unwrap().position, Position::new(50.0, 50.0));
    }

    #[tokio::test]
    async fn test_poll_during_gesture_does_not_revert_it() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let selection = select_with_store(docs, local).await;
        let mut store = WidgetStore::new(selection, StoreSettings::default());
        let start = Instant::now();
        store.upsert("light.a", pos(1.0, 1.0)).await;
        store.notify_change("light.a", pos(50.0, 50.0), start);

        assert!(store.poll_remote().await.is_empty());
        assert!(store.end_gesture("light.a").await);

        // Remote now agrees with the finished gesture
        assert!(store.poll_remote().await.is_empty());
        assert_eq!(store.get("light.a").unwrap().position, Position::new(50.0, 50.0));
    }

    #[tokio::test]
    async fn test_poll_remote_only_for_shared_backends() {
        let local = Arc::new(LocalBackend::new(LocalCache::in_memory()));
        let mut store = WidgetStore::new(BackendSelection::local(local), StoreSettings::default());
        assert!(store.poll_remote().await.is_empty());

        let docs = Arc::new(MemoryDocumentStore::new());
        let selection = select_with_store(docs.clone(), Arc::new(LocalBackend::new(LocalCache::in_memory()))).await;
        let mut first = WidgetStore::new(selection, StoreSettings::default());
        let selection = select_with_store(docs, Arc::new(LocalBackend::new(LocalCache::in_memory()))).await;
        let mut second = WidgetStore::new(selection, StoreSettings::default());
        second.load(&EntityCatalog::new()).await;

        first.upsert("light.a", pos(4.0, 4.0)).await;
        let changes = second.poll_remote().await;
        assert_eq!(changes.changed, vec!["light.a".to_string()]);
        assert_eq!(second.get("light.a").unwrap().position, Position::new(4.0, 4.0));
    }

    #[tokio::test]
    async fn test_scroll_is_debounced_toggles_are_not() {
        let backend = Arc::new(RecordingBackend::default());
        let mut store = store_on(backend.clone());
        let start = Instant::now();

        store
            .update_ui(
                UiSettings {
                    scroll_position: Some(crate::data::ScrollPosition { x: 10.0, y: 20.0 }),
                    ..UiSettings::default()
                },
                start,
            )
            .await;
        assert!(backend.ops().is_empty());
        assert_eq!(store.flush_due(start + Duration::from_millis(1000)).await, 1);
        assert_eq!(backend.ops(), vec!["ui"]);

        store
            .update_ui(
                UiSettings {
                    labels_visible: Some(false),
                    ..UiSettings::default()
                },
                start,
            )
            .await;
        assert_eq!(backend.ops(), vec!["ui", "ui"]);
        assert!(!store.ui().labels_visible());
    }
}
