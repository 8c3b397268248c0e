//! Viewport queries against a built cluster index

use crate::{ClusterId, ClusterIndex, EntityId, Viewport, utils};
use geo::Point;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Something the rendering layer should draw
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")
)]
pub enum RenderFeature {
    /// Aggregated group of entities drawn as one point
    Cluster {
        id: ClusterId,
        centroid: Point<f64>,
        point_count: usize,
        expansion_zoom: u8,
    },
    /// Single entity drawn individually
    Leaf {
        entity_id: EntityId,
        primary_anchor: Point<f64>,
        secondary_anchor: Option<Point<f64>>,
        /// Midpoint of the two anchors, where the label goes
        label_anchor: Point<f64>,
    },
}

impl RenderFeature {
    /// Map position of the feature: centroid for clusters, primary anchor for leaves
    #[inline]
    pub fn position(&self) -> Point<f64> {
        match self {
            RenderFeature::Cluster { centroid, .. } => *centroid,
            RenderFeature::Leaf { primary_anchor, .. } => *primary_anchor,
        }
    }

    #[inline]
    pub fn point_count(&self) -> usize {
        match self {
            RenderFeature::Cluster { point_count, .. } => *point_count,
            RenderFeature::Leaf { .. } => 1,
        }
    }

    #[inline]
    pub fn is_cluster(&self) -> bool {
        matches!(self, RenderFeature::Cluster { .. })
    }

    #[inline]
    pub fn cluster_id(&self) -> Option<ClusterId> {
        match self {
            RenderFeature::Cluster { id, .. } => Some(*id),
            RenderFeature::Leaf { .. } => None,
        }
    }

    #[inline]
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            RenderFeature::Leaf { entity_id, .. } => Some(entity_id),
            RenderFeature::Cluster { .. } => None,
        }
    }

    /// Short count label for cluster badges ("12", "3.4k", "27k")
    pub fn abbreviated_count(&self) -> String {
        let count = self.point_count();
        if count >= 10_000 {
            format!("{}k", (count as f64 / 1000.0).round() as usize)
        } else if count >= 1000 {
            format!("{:.1}k", (count as f64 / 100.0).round() / 10.0)
        } else {
            count.to_string()
        }
    }
}

/// Features to draw for a viewport
///
/// Bounds spanning 360° or more cover the whole world. Bounds that cross the antimeridian
/// after longitude normalization are answered as two queries, east half first.
pub fn query(index: &ClusterIndex, viewport: &Viewport) -> Vec<RenderFeature> {
    #[cfg(feature = "profiling")]
    profiling::scope!("query::query");

    let bounds = viewport.bounds;
    let min_lat = bounds.min().y.clamp(-90.0, 90.0);
    let max_lat = bounds.max().y.clamp(-90.0, 90.0);
    let (mut min_lng, mut max_lng) = (bounds.min().x, bounds.max().x);

    if !(min_lng.is_finite() && max_lng.is_finite() && min_lat.is_finite() && max_lat.is_finite())
    {
        tracing::warn!("Ignoring query with non-finite bounds {:?}", bounds);
        return Vec::new();
    }

    if max_lng - min_lng >= 360.0 {
        min_lng = -180.0;
        max_lng = 180.0;
    } else {
        min_lng = utils::normalize_longitude(min_lng);
        max_lng = if max_lng == 180.0 {
            180.0
        } else {
            utils::normalize_longitude(max_lng)
        };
    }

    let mut out = Vec::new();
    if min_lng > max_lng {
        query_box(index, viewport.zoom, min_lng, min_lat, 180.0, max_lat, &mut out);
        query_box(index, viewport.zoom, -180.0, min_lat, max_lng, max_lat, &mut out);
    } else {
        query_box(index, viewport.zoom, min_lng, min_lat, max_lng, max_lat, &mut out);
    }
    out
}

fn query_box(
    index: &ClusterIndex,
    zoom: f64,
    min_lng: f64,
    min_lat: f64,
    max_lng: f64,
    max_lat: f64,
    out: &mut Vec<RenderFeature>,
) {
    // Unit-square y grows southward
    let min = (utils::lng_to_unit_x(min_lng), utils::lat_to_unit_y(max_lat));
    let max = (utils::lng_to_unit_x(max_lng), utils::lat_to_unit_y(min_lat));
    index.features_in(zoom, min, max, out);
}
