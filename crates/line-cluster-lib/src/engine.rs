//! Single owner of all engine state
//!
//! [`MapEngine`] ties the entity store, filters, cluster index, viewport and selection
//! together. Hosts drive it through named commands and observe it through
//! [`MapEngine::subscribe`]; time only advances when the host calls [`MapEngine::tick`].

use crate::filter::filtered_set_hash;
use crate::{
    CameraCommand, CameraIdleEvent, Category, ClusterError, ClusterIndex, ClusterOptions,
    Debouncer, EdgePadding, Entity, EntityId, EntityStore, FilterState, FocusSet,
    RebuildOutcome, RebuildScheduler, Region, RenderFeature, Result, SelectionCommand,
    SelectionController, SelectionState, Transition, Viewport, ViewportController, query,
};
use instant::Instant;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const MIN_DEBOUNCE_MS: u64 = 300;
const MAX_DEBOUNCE_MS: u64 = 750;

/// Configuration for the map engine
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Clustering algorithm tunables
    pub cluster: ClusterOptions,
    /// Highest zoom a cluster tap may fly to. Default: 17
    pub hard_zoom_cap: f64,
    /// Quiet period before typed search text is applied, clamped to 300..=750 ms.
    /// Default: 400
    pub debounce_ms: u64,
    /// Filtered sets of at least this many entities are indexed off the calling thread.
    /// Default: 5000
    pub background_threshold: usize,
    /// Screen padding kept clear when fitting a focused entity
    pub fit_padding: EdgePadding,
    /// Animation length of cluster expansion fly-to commands
    pub fly_duration_ms: u32,
    /// Animation length of bounds-fit commands
    pub fit_duration_ms: u32,
    /// Number of built indexes kept for reuse when a filter is toggled back. Default: 8
    pub index_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterOptions::default(),
            hard_zoom_cap: 17.0,
            debounce_ms: 400,
            background_threshold: 5000,
            fit_padding: EdgePadding::default(),
            fly_duration_ms: 800,
            fit_duration_ms: 600,
            index_cache_capacity: 8,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        if !self.hard_zoom_cap.is_finite() || self.hard_zoom_cap < 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "hard zoom cap must be a non-negative number, got {}",
                self.hard_zoom_cap
            )));
        }
        let padding = &self.fit_padding;
        if [padding.top, padding.right, padding.bottom, padding.left]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(ClusterError::InvalidConfig(format!(
                "fit padding must be non-negative, got {:?}",
                padding
            )));
        }
        if self.index_cache_capacity == 0 {
            return Err(ClusterError::InvalidConfig(
                "index cache capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective search debounce after clamping
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS))
    }
}

/// Notification delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The features to draw for the current viewport changed
    FeaturesChanged(Vec<RenderFeature>),
    /// The camera should move; only emitted while the map is mounted
    Camera(CameraCommand),
    FocusChanged(FocusSet),
    /// A different index became active
    IndexRebuilt {
        build: u64,
        leaf_count: usize,
        /// Whether the index came from the memo instead of a fresh build
        reused: bool,
    },
}

/// Handle returned by [`MapEngine::subscribe`], unique for the engine's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Information about the engine state
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineInfo {
    /// Entities in the current store snapshot
    pub entity_count: usize,
    /// Entities passing the applied filter
    pub filtered_count: usize,
    /// Leaves in the active index
    pub indexed_count: usize,
    /// Filtered entities left out of the active index for lacking a valid anchor
    pub skipped_count: usize,
    pub build_number: Option<u64>,
    pub rebuild_in_flight: bool,
    pub cached_indexes: usize,
    pub feature_count: usize,
    /// Number of accepted viewport changes
    pub viewport_revision: u64,
}

/// Memo key of a built index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct IndexKey {
    set_hash: u64,
    /// Zoom range the index was built for
    zoom_band: (u8, u8),
}

/// Subscriber callback; `Send` so an engine can be handed to another thread
type Observer = Box<dyn FnMut(&EngineEvent) + Send>;

/// Clustering and viewport synchronization engine
pub struct MapEngine {
    config: Config,
    store: EntityStore,
    filter: FilterState,
    search: Debouncer<String>,
    filtered_count: usize,
    index_cache: LruCache<IndexKey, Arc<ClusterIndex>>,
    active: Option<Arc<ClusterIndex>>,
    active_key: Option<IndexKey>,
    building_key: Option<IndexKey>,
    scheduler: RebuildScheduler,
    viewport: ViewportController,
    selection: SelectionController,
    features: Vec<RenderFeature>,
    map_mounted: bool,
    pending_deep_link: Option<EntityId>,
    subscribers: Vec<(SubscriptionId, Observer)>,
    next_subscription: u64,
}

impl std::fmt::Debug for MapEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapEngine")
            .field("config", &self.config)
            .field("filter", &self.filter)
            .field("info", &self.info())
            .field("selection", self.selection.state())
            .field("map_mounted", &self.map_mounted)
            .field("pending_deep_link", &self.pending_deep_link)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl MapEngine {
    /// Create an engine with an empty entity store
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.index_cache_capacity).ok_or_else(|| {
            ClusterError::InvalidConfig("index cache capacity must be at least 1".to_string())
        })?;

        let mut engine = Self {
            search: Debouncer::new(config.debounce()),
            index_cache: LruCache::new(capacity),
            scheduler: RebuildScheduler::new(config.background_threshold),
            selection: SelectionController::new(
                config.hard_zoom_cap,
                config.fit_padding,
                config.fly_duration_ms,
                config.fit_duration_ms,
            ),
            config,
            store: EntityStore::default(),
            filter: FilterState::default(),
            filtered_count: 0,
            active: None,
            active_key: None,
            building_key: None,
            viewport: ViewportController::new(),
            features: Vec::new(),
            map_mounted: false,
            pending_deep_link: None,
            subscribers: Vec::new(),
            next_subscription: 0,
        };
        engine.refilter();
        Ok(engine)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Replace the entity store with a full-replacement feed
    pub fn set_entities(&mut self, entities: Vec<Entity>) {
        let revision = self.store.revision() + 1;
        self.set_store(EntityStore::new(entities, revision));
    }

    /// Replace the entity store with a prepared snapshot
    pub fn set_store(&mut self, store: EntityStore) {
        tracing::debug!(
            "Entity store replaced: revision {} with {} entities",
            store.revision(),
            store.len()
        );
        self.store = store;
        self.refilter();
        self.try_apply_deep_link();
    }

    /// Apply a camera-idle event. Never rebuilds the index.
    pub fn set_viewport(&mut self, event: &CameraIdleEvent) {
        if self.viewport.apply_camera_idle(event) {
            self.requery();
        }
    }

    /// Apply a delta-based region. Never rebuilds the index.
    pub fn set_region(&mut self, region: &Region) {
        if self.viewport.apply_region(region) {
            self.requery();
        }
    }

    /// Queue new search text; it is applied once the debounce delay passes without edits
    pub fn set_search_text(&mut self, text: impl Into<String>, now: Instant) {
        self.search.push(text.into(), now);
    }

    /// Change the category, applied immediately together with any queued search text
    pub fn set_category(&mut self, category: Category) {
        let text_changed = self.take_queued_search();
        if !text_changed && self.filter.category == category {
            return;
        }
        self.filter.category = category;
        self.refilter();
    }

    /// Handle a tap or other selection input
    pub fn select(&mut self, command: SelectionCommand) {
        let transition = self.selection.handle(
            command,
            &self.store,
            self.active.as_deref(),
            self.viewport.zoom(),
        );
        self.dispatch(transition);
    }

    pub fn clear_selection(&mut self) {
        self.select(SelectionCommand::Clear);
    }

    /// Focus an entity from an external link
    ///
    /// The link is held until the entity is in the store and the map is mounted, then
    /// applied once. A newer link replaces one still pending.
    pub fn open_deep_link(&mut self, id: impl Into<EntityId>) {
        let id = id.into();
        if let Some(previous) = self.pending_deep_link.replace(id) {
            tracing::debug!("Replacing pending deep link to {}", previous);
        }
        self.try_apply_deep_link();
    }

    /// Tell the engine whether the map control can currently animate the camera
    pub fn set_map_mounted(&mut self, mounted: bool) {
        self.map_mounted = mounted;
        self.try_apply_deep_link();
    }

    /// Advance time: apply debounced search text and finished background rebuilds
    pub fn tick(&mut self, now: Instant) {
        if let Some(text) = self.search.poll(now) {
            if text != self.filter.search_text {
                self.filter.search_text = text;
                self.refilter();
            }
        }
        if let Some(outcome) = self.scheduler.poll() {
            self.apply_outcome(outcome);
        }
    }

    /// Block until an in-flight background rebuild finishes or `timeout` elapses
    ///
    /// Returns `true` if a rebuild result was applied.
    pub fn wait_for_rebuild(&mut self, timeout: Duration) -> bool {
        match self.scheduler.wait(timeout) {
            Some(outcome) => {
                self.apply_outcome(outcome);
                true
            }
            None => false,
        }
    }

    /// Register an observer for engine events
    pub fn subscribe(
        &mut self,
        observer: impl FnMut(&EngineEvent) + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Filter currently applied to the index (queued search text excluded)
    #[inline]
    pub fn filter(&self) -> &FilterState {
        &self.filter
    }

    #[inline]
    pub fn viewport(&self) -> Option<&Viewport> {
        self.viewport.current()
    }

    /// Features for the current viewport, empty until the first viewport arrives
    #[inline]
    pub fn features(&self) -> &[RenderFeature] {
        &self.features
    }

    #[inline]
    pub fn active_index(&self) -> Option<&Arc<ClusterIndex>> {
        self.active.as_ref()
    }

    #[inline]
    pub fn selection_state(&self) -> &SelectionState {
        self.selection.state()
    }

    #[inline]
    pub fn focus_set(&self) -> FocusSet {
        self.selection.focus_set()
    }

    #[inline]
    pub fn pending_deep_link(&self) -> Option<&EntityId> {
        self.pending_deep_link.as_ref()
    }

    #[inline]
    pub fn is_map_mounted(&self) -> bool {
        self.map_mounted
    }

    /// Earliest instant at which [`Self::tick`] has queued search text to apply
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.search.deadline()
    }

    pub fn info(&self) -> EngineInfo {
        let active = self.active.as_deref();
        EngineInfo {
            entity_count: self.store.len(),
            filtered_count: self.filtered_count,
            indexed_count: active.map_or(0, |i| i.len()),
            skipped_count: active.map_or(0, |i| i.skipped()),
            build_number: active.map(|i| i.build_number()),
            rebuild_in_flight: self.scheduler.is_busy(),
            cached_indexes: self.index_cache.len(),
            feature_count: self.features.len(),
            viewport_revision: self.viewport.revision(),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn take_queued_search(&mut self) -> bool {
        match self.search.flush() {
            Some(text) if text != self.filter.search_text => {
                self.filter.search_text = text;
                true
            }
            _ => false,
        }
    }

    #[inline]
    fn zoom_band(&self) -> (u8, u8) {
        (self.config.cluster.min_zoom, self.config.cluster.max_zoom)
    }

    /// Re-run the filter and make sure an index for the result is active or being built
    fn refilter(&mut self) {
        let filtered = self.filter.apply(&self.store);
        self.filtered_count = filtered.len();
        let key = IndexKey {
            set_hash: filtered_set_hash(&filtered),
            zoom_band: self.zoom_band(),
        };

        if self.active_key == Some(key) {
            tracing::debug!("Filtered set unchanged, keeping index");
            self.supersede_build();
            return;
        }
        if let Some(index) = self.index_cache.get(&key).cloned() {
            tracing::debug!("Reusing memoized index #{}", index.build_number());
            self.supersede_build();
            self.activate(key, index, true);
            return;
        }
        if self.building_key == Some(key) && self.scheduler.is_busy() {
            return;
        }

        self.building_key = Some(key);
        self.scheduler
            .start(filtered, self.config.cluster.clone(), key.set_hash);
        // Small sets are built inline and can be applied right away
        if let Some(outcome) = self.scheduler.poll() {
            self.apply_outcome(outcome);
        }
    }

    /// Drop the build still running for a filtered set that is no longer wanted
    fn supersede_build(&mut self) {
        if self.scheduler.is_busy() {
            self.scheduler.cancel();
        }
        self.building_key = None;
    }

    fn apply_outcome(&mut self, outcome: RebuildOutcome) {
        self.building_key = None;
        match outcome {
            RebuildOutcome::Ready { key, index, .. } => {
                let key = IndexKey {
                    set_hash: key,
                    zoom_band: self.zoom_band(),
                };
                let index = Arc::new(index);
                self.index_cache.put(key, index.clone());
                self.activate(key, index, false);
            }
            RebuildOutcome::Failed { generation, error } => {
                tracing::debug!(
                    "Keeping previous index after rebuild #{}: {}",
                    generation,
                    error
                );
            }
        }
    }

    fn activate(&mut self, key: IndexKey, index: Arc<ClusterIndex>, reused: bool) {
        let event = EngineEvent::IndexRebuilt {
            build: index.build_number(),
            leaf_count: index.len(),
            reused,
        };
        self.active = Some(index);
        self.active_key = Some(key);
        self.emit(event);
        self.requery();
    }

    fn requery(&mut self) {
        let (Some(index), Some(viewport)) = (self.active.as_deref(), self.viewport.current())
        else {
            return;
        };
        let features = query(index, viewport);
        if features != self.features {
            self.features = features;
            self.emit(EngineEvent::FeaturesChanged(self.features.clone()));
        }
    }

    fn try_apply_deep_link(&mut self) {
        let ready = match &self.pending_deep_link {
            Some(id) => self.map_mounted && self.store.contains(id),
            None => false,
        };
        if !ready {
            return;
        }
        if let Some(id) = self.pending_deep_link.take() {
            tracing::debug!("Applying deep link to {}", id);
            self.select(SelectionCommand::DeepLink(id));
        }
    }

    fn dispatch(&mut self, transition: Transition) {
        if let Some(focus) = transition.focus {
            self.emit(EngineEvent::FocusChanged(focus));
        }
        if let Some(command) = transition.camera {
            if self.map_mounted {
                self.emit(EngineEvent::Camera(command));
            } else {
                tracing::debug!(
                    "Dropping camera command while the map is not mounted: {:?}",
                    command
                );
            }
        }
    }

    fn emit(&mut self, event: EngineEvent) {
        for (_, observer) in self.subscribers.iter_mut() {
            observer(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LngLat, utils};
    use std::sync::Mutex;

    fn create_test_entities() -> Vec<Entity> {
        vec![
            Entity::new("A", "River Walk", (0.0, 0.0), (0.01, 0.02)).with_favorite(true),
            Entity::new("B", "Riverside", (0.0, 0.0001), (0.02, 0.01)),
            Entity::new("X", "Harbour Line", (-23.5, -46.6), (-23.6, -46.4)).with_status("open"),
        ]
    }

    fn world_event(zoom: f64) -> CameraIdleEvent {
        CameraIdleEvent {
            center_lng: 0.0,
            center_lat: 0.0,
            zoom,
            bounds_southwest: LngLat::new(-179.0, -80.0),
            bounds_northeast: LngLat::new(179.0, 80.0),
        }
    }

    fn recorder(engine: &mut MapEngine) -> Arc<Mutex<Vec<EngineEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    fn rebuilds(events: &Mutex<Vec<EngineEvent>>) -> Vec<(u64, bool)> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::IndexRebuilt { build, reused, .. } => Some((*build, *reused)),
                _ => None,
            })
            .collect()
    }

    fn create_test_engine() -> MapEngine {
        let mut engine = MapEngine::new(Config::default()).unwrap();
        engine.set_entities(create_test_entities());
        engine
    }

    #[test]
    fn test_config_validate() {
        assert!(Config::default().validate().is_ok());
        let bad = Config {
            index_cache_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            MapEngine::new(bad),
            Err(ClusterError::InvalidConfig(_))
        ));
        let bad = Config {
            hard_zoom_cap: f64::NAN,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_debounce_is_clamped() {
        let config = |debounce_ms| Config {
            debounce_ms,
            ..Default::default()
        };
        assert_eq!(config(100).debounce(), Duration::from_millis(300));
        assert_eq!(config(400).debounce(), Duration::from_millis(400));
        assert_eq!(config(5000).debounce(), Duration::from_millis(750));
    }

    #[test]
    fn test_empty_feed() {
        let mut engine = MapEngine::new(Config::default()).unwrap();
        engine.set_entities(Vec::new());
        engine.set_viewport(&world_event(3.0));
        assert!(engine.features().is_empty());
        assert_eq!(engine.info().indexed_count, 0);
        assert!(engine.active_index().is_some());
    }

    #[test]
    fn test_debounced_typing_triggers_one_rebuild() {
        let mut engine = create_test_engine();
        let events = recorder(&mut engine);
        let start = Instant::now();

        engine.set_search_text("r", start);
        engine.set_search_text("ri", start + Duration::from_millis(100));
        engine.set_search_text("riv", start + Duration::from_millis(200));

        engine.tick(start + Duration::from_millis(500));
        assert!(rebuilds(&events).is_empty());
        assert_eq!(engine.filter().search_text, "");

        engine.tick(start + Duration::from_millis(600));
        assert_eq!(rebuilds(&events).len(), 1);
        assert_eq!(engine.filter().search_text, "riv");
        assert_eq!(engine.info().filtered_count, 2);

        engine.tick(start + Duration::from_secs(2));
        assert_eq!(rebuilds(&events).len(), 1);
    }

    #[test]
    fn test_pan_does_not_rebuild() {
        let mut engine = create_test_engine();
        let build = engine.info().build_number;
        let events = recorder(&mut engine);

        engine.set_viewport(&world_event(2.0));
        engine.set_viewport(&CameraIdleEvent {
            bounds_southwest: LngLat::new(-50.0, -30.0),
            bounds_northeast: LngLat::new(-40.0, -20.0),
            ..world_event(2.0)
        });
        engine.set_region(&Region::new(0.0, 0.0, 1.0, 1.0));

        assert!(rebuilds(&events).is_empty());
        assert_eq!(engine.info().build_number, build);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, EngineEvent::FeaturesChanged(_))));
    }

    #[test]
    fn test_toggling_filter_reuses_memoized_index() {
        let mut engine = create_test_engine();
        let original = engine.info().build_number;
        let events = recorder(&mut engine);

        engine.set_category(Category::Favorites);
        assert_eq!(engine.info().filtered_count, 1);
        engine.set_category(Category::All);

        assert_eq!(engine.info().build_number, original);
        let log = rebuilds(&events);
        assert_eq!(log.len(), 2);
        assert!(!log[0].1);
        assert_eq!(log[1], (original.unwrap(), true));
    }

    #[test]
    fn test_category_applies_queued_search() {
        let mut engine = create_test_engine();
        engine.set_search_text("harbour", Instant::now());
        engine.set_category(Category::Status("OPEN".into()));
        assert_eq!(engine.filter().search_text, "harbour");
        assert_eq!(engine.info().filtered_count, 1);
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn test_features_follow_viewport() {
        let mut engine = create_test_engine();
        assert!(engine.features().is_empty());

        engine.set_viewport(&world_event(3.0));
        let total: usize = engine.features().iter().map(|f| f.point_count()).sum();
        assert_eq!(total, 3);
        assert_eq!(engine.features().iter().filter(|f| f.is_cluster()).count(), 1);
    }

    #[test]
    fn test_deep_link_waits_for_store_and_mount() {
        let mut engine = MapEngine::new(Config::default()).unwrap();
        let events = recorder(&mut engine);

        engine.open_deep_link("X");
        engine.set_entities(create_test_entities());
        assert_eq!(engine.selection_state(), &SelectionState::Idle);
        assert!(engine.pending_deep_link().is_some());

        engine.set_map_mounted(true);
        assert_eq!(
            engine.selection_state(),
            &SelectionState::SingleFocused(EntityId::from("X"))
        );
        assert!(engine.pending_deep_link().is_none());

        let camera: Vec<CameraCommand> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Camera(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(camera.len(), 1);
        let CameraCommand::FitBounds {
            bounds, padding, ..
        } = camera[0]
        else {
            panic!("expected a bounds fit");
        };
        assert_eq!(utils::bbox_to_array(&bounds), [-46.6, -23.6, -46.4, -23.5]);
        assert_eq!(padding, engine.config().fit_padding);

        // Applied exactly once
        engine.set_map_mounted(false);
        engine.set_map_mounted(true);
        let camera_count = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, EngineEvent::Camera(_)))
            .count();
        assert_eq!(camera_count, 1);
    }

    #[test]
    fn test_camera_dropped_while_unmounted() {
        let mut engine = create_test_engine();
        let events = recorder(&mut engine);

        engine.select(SelectionCommand::TapLeaf("A".into()));
        let log = events.lock().unwrap();
        assert!(log.iter().any(|e| matches!(e, EngineEvent::FocusChanged(_))));
        assert!(!log.iter().any(|e| matches!(e, EngineEvent::Camera(_))));
    }

    #[test]
    fn test_cluster_tap_at_cap_focuses_leaves() {
        let mut engine = create_test_engine();
        engine.set_map_mounted(true);
        engine.set_region(&Region::new(0.0, 0.0, 0.004, 0.004));
        let cluster = engine
            .features()
            .iter()
            .find_map(|f| f.cluster_id())
            .unwrap();

        // Region zoom is round(log2(360 / 0.004)) = 16, below the cap, so the tap zooms in
        engine.select(SelectionCommand::TapCluster(cluster));
        assert_eq!(engine.selection_state(), &SelectionState::Idle);

        engine.set_region(&Region::new(0.0, 0.0, 0.002, 0.002));
        let cluster = engine
            .features()
            .iter()
            .find_map(|f| f.cluster_id())
            .unwrap();
        engine.select(SelectionCommand::TapCluster(cluster));
        assert_eq!(
            engine.focus_set().ids(),
            &[EntityId::from("A"), EntityId::from("B")]
        );
    }

    #[test]
    fn test_stale_cluster_tap_is_noop() {
        let mut engine = create_test_engine();
        engine.set_viewport(&world_event(3.0));
        let stale = engine
            .features()
            .iter()
            .find_map(|f| f.cluster_id())
            .unwrap();

        engine.set_entities(vec![
            Entity::new("A", "River Walk", (0.0, 0.0), (0.01, 0.02)),
            Entity::new("B", "Riverside", (0.0, 0.0002), (0.02, 0.01)),
        ]);
        let events = recorder(&mut engine);
        engine.select(SelectionCommand::TapCluster(stale));

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(engine.selection_state(), &SelectionState::Idle);
    }

    #[test]
    fn test_background_rebuild() {
        let config = Config {
            background_threshold: 100,
            ..Default::default()
        };
        let mut engine = MapEngine::new(config).unwrap();
        let entities: Vec<Entity> = (0..500)
            .map(|i| {
                let lat = (i % 25) as f64 * 0.2;
                let lng = (i / 25) as f64 * 0.2;
                Entity::new(format!("e{i}"), "", (lat, lng), (lat, lng))
            })
            .collect();
        engine.set_entities(entities);

        if engine.info().rebuild_in_flight {
            assert!(engine.wait_for_rebuild(Duration::from_secs(30)));
        }
        assert!(!engine.info().rebuild_in_flight);
        assert_eq!(engine.info().indexed_count, 500);
    }

    fn create_large_engine() -> MapEngine {
        let config = Config {
            background_threshold: 10,
            ..Default::default()
        };
        let mut engine = MapEngine::new(config).unwrap();
        let entities: Vec<Entity> = (0..4000)
            .map(|i| {
                let lat = (i % 80) as f64 * 0.05;
                let lng = (i / 80) as f64 * 0.05;
                let status = if i % 4 == 0 { "open" } else { "closed" };
                Entity::new(format!("e{i}"), "", (lat, lng), (lat, lng))
                    .with_favorite(i % 2 == 0)
                    .with_status(status)
            })
            .collect();
        engine.set_entities(entities);
        if engine.info().rebuild_in_flight {
            assert!(engine.wait_for_rebuild(Duration::from_secs(60)));
        }
        assert_eq!(engine.info().indexed_count, 4000);
        engine
    }

    fn leaf_counts(events: &Mutex<Vec<EngineEvent>>) -> Vec<usize> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::IndexRebuilt { leaf_count, .. } => Some(*leaf_count),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_leaving_filter_before_background_build_finishes() {
        let mut engine = create_large_engine();
        let events = recorder(&mut engine);

        engine.set_category(Category::Favorites);
        engine.set_category(Category::All);
        assert!(!engine.info().rebuild_in_flight);

        engine.wait_for_rebuild(Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(200));
        engine.tick(Instant::now());

        assert_eq!(engine.filter().category, Category::All);
        assert_eq!(engine.info().filtered_count, 4000);
        assert_eq!(engine.info().indexed_count, 4000);
        // Only an index for the applied filter may ever have been activated last
        assert_eq!(leaf_counts(&events).last().copied().unwrap_or(4000), 4000);
    }

    #[test]
    fn test_memoized_filter_supersedes_background_build() {
        let mut engine = create_large_engine();
        engine.set_category(Category::Status("open".into()));
        if engine.info().rebuild_in_flight {
            assert!(engine.wait_for_rebuild(Duration::from_secs(60)));
        }
        assert_eq!(engine.info().indexed_count, 1000);
        engine.set_category(Category::All);

        let events = recorder(&mut engine);
        engine.set_category(Category::Favorites);
        engine.set_category(Category::Status("open".into()));

        engine.wait_for_rebuild(Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(200));
        engine.tick(Instant::now());

        assert_eq!(engine.info().filtered_count, 1000);
        assert_eq!(engine.info().indexed_count, 1000);
        assert_eq!(leaf_counts(&events).last(), Some(&1000));
        assert!(rebuilds(&events).last().is_some_and(|(_, reused)| *reused));
    }

    #[test]
    fn test_viewport_revision_in_info() {
        let mut engine = create_test_engine();
        assert_eq!(engine.info().viewport_revision, 0);
        engine.set_viewport(&world_event(3.0));
        engine.set_viewport(&world_event(3.0));
        assert_eq!(engine.info().viewport_revision, 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut engine = create_test_engine();
        let events = Arc::new(Mutex::new(0usize));
        let sink = events.clone();
        let id = engine.subscribe(move |_| *sink.lock().unwrap() += 1);

        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));
        engine.set_viewport(&world_event(3.0));
        assert_eq!(*events.lock().unwrap(), 0);
    }
}
