//! Camera viewport tracking
//!
//! The host map control reports a camera-idle event once per settled gesture. Each event
//! replaces the previous viewport outright; nothing is queued.

use crate::utils::{self, BBox, Region};
use geo::{Coord, Point, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Longitude/latitude pair as reported by the map control
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }
}

/// Notification that the camera settled after a gesture
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct CameraIdleEvent {
    pub center_lng: f64,
    pub center_lat: f64,
    pub zoom: f64,
    pub bounds_southwest: LngLat,
    pub bounds_northeast: LngLat,
}

impl CameraIdleEvent {
    fn is_finite(&self) -> bool {
        [
            self.center_lng,
            self.center_lat,
            self.zoom,
            self.bounds_southwest.lng,
            self.bounds_southwest.lat,
            self.bounds_northeast.lng,
            self.bounds_northeast.lat,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Camera zoom plus the geographic box it shows
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    pub zoom: f64,
    pub bounds: BBox,
}

impl Viewport {
    pub fn new(zoom: f64, bounds: BBox) -> Self {
        Self { zoom, bounds }
    }

    /// Viewport for a delta-based region, zoom derived from the latitude span
    pub fn from_region(region: &Region) -> Self {
        Self {
            zoom: region.zoom() as f64,
            bounds: region.bbox(),
        }
    }

    /// Viewport for a camera-idle event
    ///
    /// A southwest corner east of the northeast corner means the view crosses the
    /// antimeridian; the east edge is unwrapped past 180° so the box stays ordered.
    pub fn from_camera_idle(event: &CameraIdleEvent) -> Self {
        let sw = event.bounds_southwest;
        let ne = event.bounds_northeast;
        let east = if sw.lng > ne.lng { ne.lng + 360.0 } else { ne.lng };
        Self {
            zoom: event.zoom,
            bounds: Rect::new(
                Coord { x: sw.lng, y: sw.lat },
                Coord {
                    x: east,
                    y: ne.lat,
                },
            ),
        }
    }

    /// Center of the box, x = longitude and y = latitude
    pub fn center(&self) -> Point<f64> {
        let c = self.bounds.center();
        Point::new(utils::normalize_longitude(c.x), c.y)
    }
}

impl Region {
    #[inline]
    pub fn to_viewport(&self) -> Viewport {
        Viewport::from_region(self)
    }
}

/// Owner of the last-known viewport
#[derive(Debug, Clone, Default)]
pub struct ViewportController {
    current: Option<Viewport>,
    revision: u64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl ViewportController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the viewport from a camera-idle event
    ///
    /// Returns `false` when the event was rejected or did not change anything.
    pub fn apply_camera_idle(&mut self, event: &CameraIdleEvent) -> bool {
        if !event.is_finite() {
            tracing::warn!("Ignoring camera-idle event with non-finite values: {:?}", event);
            return false;
        }
        self.replace(Viewport::from_camera_idle(event))
    }

    /// Replace the viewport from a delta-based region
    pub fn apply_region(&mut self, region: &Region) -> bool {
        let values = [
            region.latitude,
            region.longitude,
            region.latitude_delta,
            region.longitude_delta,
        ];
        if !values.iter().all(|v| v.is_finite()) {
            tracing::warn!("Ignoring region with non-finite values: {:?}", region);
            return false;
        }
        self.replace(Viewport::from_region(region))
    }

    fn replace(&mut self, viewport: Viewport) -> bool {
        if self.current == Some(viewport) {
            return false;
        }
        self.current = Some(viewport);
        self.revision += 1;
        true
    }

    #[inline]
    pub fn current(&self) -> Option<&Viewport> {
        self.current.as_ref()
    }

    /// Current camera zoom, `None` until the first camera-idle event
    #[inline]
    pub fn zoom(&self) -> Option<f64> {
        self.current.map(|v| v.zoom)
    }

    /// Number of accepted viewport changes
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(zoom: f64, sw: (f64, f64), ne: (f64, f64)) -> CameraIdleEvent {
        CameraIdleEvent {
            center_lng: (sw.0 + ne.0) / 2.0,
            center_lat: (sw.1 + ne.1) / 2.0,
            zoom,
            bounds_southwest: LngLat::new(sw.0, sw.1),
            bounds_northeast: LngLat::new(ne.0, ne.1),
        }
    }

    #[test]
    fn test_camera_idle_to_viewport() {
        let viewport = Viewport::from_camera_idle(&event(11.5, (2.0, 48.0), (3.0, 49.0)));
        assert_eq!(viewport.zoom, 11.5);
        assert_eq!(utils::bbox_to_array(&viewport.bounds), [2.0, 48.0, 3.0, 49.0]);
    }

    #[test]
    fn test_camera_idle_across_antimeridian() {
        let viewport = Viewport::from_camera_idle(&event(5.0, (170.0, -20.0), (-170.0, -10.0)));
        assert_eq!(
            utils::bbox_to_array(&viewport.bounds),
            [170.0, -20.0, 190.0, -10.0]
        );
        assert!((viewport.center().x().abs() - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_region_viewport() {
        let viewport = Viewport::from_region(&Region::new(-15.7782, -47.9337, 80.0, 80.0));
        assert_eq!(viewport.zoom, 2.0);
        assert_eq!(viewport.bounds.min().x, -47.9337 - 80.0);
    }

    #[test]
    fn test_last_write_wins() {
        let mut controller = ViewportController::new();
        assert!(controller.zoom().is_none());

        assert!(controller.apply_camera_idle(&event(4.0, (0.0, 0.0), (10.0, 10.0))));
        assert!(controller.apply_camera_idle(&event(9.0, (1.0, 1.0), (2.0, 2.0))));
        assert_eq!(controller.zoom(), Some(9.0));
        assert_eq!(controller.revision(), 2);
        assert_eq!(
            controller.current().map(|v| v.center()),
            Some(Point::new(1.5, 1.5))
        );
    }

    #[test]
    fn test_repeated_event_is_not_a_change() {
        let mut controller = ViewportController::new();
        let e = event(4.0, (0.0, 0.0), (10.0, 10.0));
        assert!(controller.apply_camera_idle(&e));
        assert!(!controller.apply_camera_idle(&e));
        assert_eq!(controller.revision(), 1);
    }

    #[test]
    fn test_non_finite_event_rejected() {
        let mut controller = ViewportController::new();
        assert!(!controller.apply_camera_idle(&event(f64::NAN, (0.0, 0.0), (1.0, 1.0))));
        assert!(controller.current().is_none());
        assert!(!controller.apply_region(&Region::new(0.0, 0.0, f64::INFINITY, 1.0)));
    }
}
