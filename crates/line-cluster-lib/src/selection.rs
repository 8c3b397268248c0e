//! Focus state machine and camera commands
//!
//! Every tap or deep link arrives as a [`SelectionCommand`] carrying only ids. Ids are
//! resolved against the store and index passed in at handling time, never against copies
//! captured when the feature was drawn.

use crate::utils::{self, BBox};
use crate::{ClusterId, ClusterIndex, EntityId, EntityStore};
use geo::Point;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ordered ids of the entities currently presented as selected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct FocusSet(Vec<EntityId>);

impl FocusSet {
    pub fn new(ids: Vec<EntityId>) -> Self {
        Self(ids)
    }

    #[inline]
    pub fn ids(&self) -> &[EntityId] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.0.contains(id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SelectionState {
    #[default]
    Idle,
    SingleFocused(EntityId),
    MultiFocused(Vec<EntityId>),
}

impl SelectionState {
    pub fn focus_set(&self) -> FocusSet {
        match self {
            SelectionState::Idle => FocusSet::default(),
            SelectionState::SingleFocused(id) => FocusSet(vec![id.clone()]),
            SelectionState::MultiFocused(ids) => FocusSet(ids.clone()),
        }
    }
}

/// Screen-space padding in pixels kept clear of overlay chrome when fitting bounds
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EdgePadding {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Default for EdgePadding {
    fn default() -> Self {
        // Bottom sheet covers far more of the screen than the header
        Self {
            top: 80.0,
            right: 40.0,
            bottom: 320.0,
            left: 40.0,
        }
    }
}

/// Camera movement requested from the rendering layer
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")
)]
pub enum CameraCommand {
    FlyTo {
        center: Point<f64>,
        zoom: f64,
        duration_ms: u32,
    },
    FitBounds {
        bounds: BBox,
        padding: EdgePadding,
        duration_ms: u32,
    },
}

/// Fully resolved camera position, the shape the map control animates to
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct CameraTarget {
    pub center_lng: f64,
    pub center_lat: f64,
    pub zoom: f64,
    pub duration_ms: u32,
}

impl CameraCommand {
    /// Resolve into a center/zoom pair for a screen of `screen` (width, height) pixels
    ///
    /// Bounds are fit inside the screen minus the padding, at most at `zoom_cap`, and the
    /// center is shifted so the bounds sit in the middle of the unpadded area.
    pub fn resolve(&self, screen: (f64, f64), tile_size: f64, zoom_cap: f64) -> CameraTarget {
        match *self {
            CameraCommand::FlyTo {
                center,
                zoom,
                duration_ms,
            } => CameraTarget {
                center_lng: center.x(),
                center_lat: center.y(),
                zoom,
                duration_ms,
            },
            CameraCommand::FitBounds {
                bounds,
                padding,
                duration_ms,
            } => {
                let avail_w = (screen.0 - padding.left - padding.right).max(1.0);
                let avail_h = (screen.1 - padding.top - padding.bottom).max(1.0);

                let x0 = utils::lng_to_unit_x(bounds.min().x);
                let x1 = utils::lng_to_unit_x(bounds.max().x);
                let y0 = utils::lat_to_unit_y(bounds.max().y);
                let y1 = utils::lat_to_unit_y(bounds.min().y);

                let fit = |avail: f64, span: f64| {
                    if span > 0.0 {
                        (avail / (span * tile_size)).log2()
                    } else {
                        f64::INFINITY
                    }
                };
                let zoom = fit(avail_w, x1 - x0)
                    .min(fit(avail_h, y1 - y0))
                    .min(zoom_cap)
                    .max(0.0);

                let world = tile_size * 2f64.powf(zoom);
                let cx = (x0 + x1) / 2.0 - (padding.left - padding.right) / 2.0 / world;
                let cy = (y0 + y1) / 2.0 - (padding.top - padding.bottom) / 2.0 / world;

                CameraTarget {
                    center_lng: utils::normalize_longitude(utils::unit_x_to_lng(cx)),
                    center_lat: utils::unit_y_to_lat(cy.clamp(0.0, 1.0)),
                    zoom,
                    duration_ms,
                }
            }
        }
    }
}

/// Input to the selection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SelectionCommand {
    TapBackground,
    TapLeaf(EntityId),
    TapCluster(ClusterId),
    DeepLink(EntityId),
    Clear,
}

/// Effects of handling one command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    /// New focus set, present only when it changed
    pub focus: Option<FocusSet>,
    pub camera: Option<CameraCommand>,
}

impl Transition {
    #[inline]
    pub fn is_noop(&self) -> bool {
        self.focus.is_none() && self.camera.is_none()
    }
}

/// Owner of the focus state
#[derive(Debug, Clone)]
pub struct SelectionController {
    state: SelectionState,
    hard_zoom_cap: f64,
    fit_padding: EdgePadding,
    fly_duration_ms: u32,
    fit_duration_ms: u32,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SelectionController {
    pub fn new(
        hard_zoom_cap: f64,
        fit_padding: EdgePadding,
        fly_duration_ms: u32,
        fit_duration_ms: u32,
    ) -> Self {
        Self {
            state: SelectionState::Idle,
            hard_zoom_cap,
            fit_padding,
            fly_duration_ms,
            fit_duration_ms,
        }
    }

    #[inline]
    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    #[inline]
    pub fn focus_set(&self) -> FocusSet {
        self.state.focus_set()
    }

    /// Apply a command against the current snapshots
    ///
    /// `current_zoom` is `None` before the first camera-idle event.
    pub fn handle(
        &mut self,
        command: SelectionCommand,
        store: &EntityStore,
        index: Option<&ClusterIndex>,
        current_zoom: Option<f64>,
    ) -> Transition {
        match command {
            SelectionCommand::TapBackground | SelectionCommand::Clear => {
                self.set_state(SelectionState::Idle)
            }
            SelectionCommand::TapLeaf(id) | SelectionCommand::DeepLink(id) => {
                self.focus_entity(id, store)
            }
            SelectionCommand::TapCluster(id) => {
                self.tap_cluster(id, store, index, current_zoom.unwrap_or(0.0))
            }
        }
    }

    fn focus_entity(&mut self, id: EntityId, store: &EntityStore) -> Transition {
        let entity = match store.resolve(&id) {
            Ok(entity) => entity,
            Err(e) => {
                tracing::warn!("Ignoring selection: {}", e);
                return Transition::default();
            }
        };

        let camera = match entity.fit_anchors() {
            Some((a, b)) => Some(CameraCommand::FitBounds {
                bounds: utils::bbox_from_anchors(a, b),
                padding: self.fit_padding,
                duration_ms: self.fit_duration_ms,
            }),
            None => {
                tracing::warn!("Entity {} has no valid anchors to fit the camera to", id);
                None
            }
        };

        let mut transition = self.set_state(SelectionState::SingleFocused(id));
        transition.camera = camera;
        transition
    }

    fn tap_cluster(
        &mut self,
        id: ClusterId,
        store: &EntityStore,
        index: Option<&ClusterIndex>,
        current_zoom: f64,
    ) -> Transition {
        let Some(index) = index else {
            tracing::warn!("Ignoring tap on cluster {} while no index is active", id);
            return Transition::default();
        };
        let node = match index.resolve_cluster(id) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!("Ignoring cluster tap: {}", e);
                return Transition::default();
            }
        };

        let target_zoom = (node.expansion_zoom as f64).min(self.hard_zoom_cap);
        if target_zoom > current_zoom {
            return Transition {
                focus: None,
                camera: Some(CameraCommand::FlyTo {
                    center: node.centroid,
                    zoom: target_zoom,
                    duration_ms: self.fly_duration_ms,
                }),
            };
        }

        let ids: Vec<EntityId> = node
            .leaf_ids
            .into_iter()
            .filter(|leaf| {
                let present = store.contains(leaf);
                if !present {
                    tracing::warn!("Cluster leaf {} is no longer in the entity store", leaf);
                }
                present
            })
            .collect();
        self.set_state(SelectionState::MultiFocused(ids))
    }

    fn set_state(&mut self, state: SelectionState) -> Transition {
        if self.state == state {
            return Transition::default();
        }
        self.state = state;
        Transition {
            focus: Some(self.state.focus_set()),
            camera: None,
        }
    }
}
