//! Drives one engine session from the command-line settings and collects a report

use crate::error::ProbeError;
use crate::settings::Settings;
use instant::Instant;
use line_cluster_lib::{
    CameraCommand, CameraIdleEvent, CameraTarget, Config, EngineEvent, EngineInfo, EntityRecord,
    EntityStore, FocusSet, MapEngine, Region, RenderFeature, SelectionCommand, SelectionState,
    Viewport,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REBUILD_TIMEOUT: Duration = Duration::from_secs(120);

/// Camera command together with the position it resolves to on the probe's screen
#[derive(Debug, Clone, Serialize)]
pub struct CameraReport {
    pub command: CameraCommand,
    pub target: CameraTarget,
}

/// Everything the rendering layer would have received
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub info: EngineInfo,
    pub viewport: Option<Viewport>,
    pub features: Vec<RenderFeature>,
    pub selection: SelectionState,
    pub focus: FocusSet,
    pub camera: Vec<CameraReport>,
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ProbeError> {
    let text = std::fs::read_to_string(path).map_err(|source| ProbeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ProbeError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every input named by the settings and run the session
pub fn execute(settings: &Settings) -> Result<Report, ProbeError> {
    let records: Vec<EntityRecord> = load_json(&settings.entities)?;
    let config = match &settings.config {
        Some(path) => load_json(path)?,
        None => Config::default(),
    };
    let camera = match &settings.camera {
        Some(path) => Some(load_json::<CameraIdleEvent>(path)?),
        None => None,
    };
    tracing::info!(
        "Loaded {} entity records from {}",
        records.len(),
        settings.entities.display()
    );
    run(settings, records, config, camera)
}

/// Run one session: filter, position the camera, replay the requested interactions
pub fn run(
    settings: &Settings,
    records: Vec<EntityRecord>,
    config: Config,
    camera: Option<CameraIdleEvent>,
) -> Result<Report, ProbeError> {
    let config = settings.apply_overrides(config);
    let zoom_cap = config.hard_zoom_cap;
    let debounce = config.debounce();
    let mut engine = MapEngine::new(config)?;

    let commands = Arc::new(Mutex::new(Vec::new()));
    let sink = commands.clone();
    engine.subscribe(move |event| {
        if let EngineEvent::Camera(command) = event {
            if let Ok(mut log) = sink.lock() {
                log.push(*command);
            }
        }
    });

    engine.set_store(EntityStore::from_records(records, 1));
    engine.set_category(settings.category.clone());
    if !settings.search.is_empty() {
        let now = Instant::now();
        engine.set_search_text(settings.search.clone(), now);
        engine.tick(now + debounce);
    }
    if engine.info().rebuild_in_flight && !engine.wait_for_rebuild(REBUILD_TIMEOUT) {
        return Err(ProbeError::InvalidArgument(format!(
            "index rebuild did not finish within {} s",
            REBUILD_TIMEOUT.as_secs()
        )));
    }

    match (camera, settings.region) {
        (Some(event), _) => engine.set_viewport(&event),
        (None, Some(region)) => engine.set_region(&region),
        // Whole world at a low zoom
        (None, None) => engine.set_region(&Region::new(0.0, 0.0, 180.0, 360.0)),
    }
    let features = engine.features().to_vec();

    engine.set_map_mounted(true);
    if let Some(id) = &settings.deep_link {
        engine.open_deep_link(id.as_str());
        if engine.pending_deep_link().is_some() {
            tracing::warn!("Deep link target {} is not in the feed", id);
        }
    }
    if let Some(id) = &settings.tap_leaf {
        engine.select(SelectionCommand::TapLeaf(id.as_str().into()));
    }
    if let Some(position) = settings.tap_cluster {
        let id = features
            .get(position)
            .and_then(|f| f.cluster_id())
            .ok_or_else(|| {
                ProbeError::InvalidArgument(format!(
                    "feature {position} is not a cluster ({} features drawn)",
                    features.len()
                ))
            })?;
        engine.select(SelectionCommand::TapCluster(id));
    }

    let screen = (settings.screen_width, settings.screen_height);
    let camera = commands
        .lock()
        .map(|log| {
            log.iter()
                .map(|command| CameraReport {
                    command: *command,
                    target: command.resolve(screen, settings.tile_size, zoom_cap),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Report {
        info: engine.info(),
        viewport: engine.viewport().copied(),
        features,
        selection: engine.selection_state().clone(),
        focus: engine.focus_set(),
        camera,
    })
}
