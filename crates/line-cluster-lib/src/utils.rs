//! Geometry helpers: great-circle math, Web Mercator projection and region/zoom conversion
//!
//! Every function here is pure. Coordinates follow the `geo` convention of x = longitude
//! and y = latitude.

use geo::{Coord, Point, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Web Mercator bounds in meters (EPSG:3857)
pub const EARTH_MERCATOR_MAX: f64 = 20037508.34;
pub const EARTH_MERCATOR_MIN: f64 = -20037508.34;
pub const EARTH_SIZE_METERS: f64 = EARTH_MERCATOR_MAX - EARTH_MERCATOR_MIN;

/// Maximum latitude that can be represented in Web Mercator
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Zoom returned by [`zoom_level`] for degenerate deltas
pub const MAX_REPRESENTABLE_ZOOM: i32 = 30;

/// Precomputed constant: EARTH_MERCATOR_MAX / 180.0
const LON_TO_X_FACTOR: f64 = EARTH_MERCATOR_MAX / 180.0;

/// Precomputed constant: EARTH_MERCATOR_MAX / PI
const Y_FACTOR: f64 = EARTH_MERCATOR_MAX / std::f64::consts::PI;

/// Precomputed constant: 180.0 / EARTH_MERCATOR_MAX
const X_TO_LON_FACTOR: f64 = 180.0 / EARTH_MERCATOR_MAX;

/// Precomputed constant: PI / EARTH_MERCATOR_MAX
const Y_TO_LAT_FACTOR: f64 = std::f64::consts::PI / EARTH_MERCATOR_MAX;

/// Geographic bounding box. `min()` is (minLng, minLat) and `max()` is (maxLng, maxLat).
///
/// Longitudes may lie outside [-180, 180] when the box was derived from a region that
/// wraps the antimeridian; the query engine normalizes them.
pub type BBox = Rect<f64>;

/// A camera region expressed as a center plus latitude/longitude spans
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Region {
    pub latitude: f64,
    pub longitude: f64,
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

impl Region {
    pub fn new(latitude: f64, longitude: f64, latitude_delta: f64, longitude_delta: f64) -> Self {
        Self {
            latitude,
            longitude,
            latitude_delta,
            longitude_delta,
        }
    }

    /// Bounding box covered by this region
    #[inline]
    pub fn bbox(&self) -> BBox {
        region_to_bbox(
            Point::new(self.longitude, self.latitude),
            self.latitude_delta,
            self.longitude_delta,
        )
    }

    /// Integer zoom matching the latitude span of this region
    #[inline]
    pub fn zoom(&self) -> i32 {
        zoom_level(self.latitude_delta)
    }
}

/// Great-circle distance in meters between two WGS84 coordinates (Haversine formula)
#[inline]
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Spherical midpoint between two WGS84 coordinates, returned as (lat, lon)
pub fn midpoint(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64) {
    if lat1 == lat2 && lon1 == lon2 {
        return (lat1, lon1);
    }

    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let lambda1 = lon1.to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let bx = phi2.cos() * delta_lon.cos();
    let by = phi2.cos() * delta_lon.sin();

    let phi_m = (phi1.sin() + phi2.sin()).atan2(((phi1.cos() + bx).powi(2) + by * by).sqrt());
    let lambda_m = lambda1 + by.atan2(phi1.cos() + bx);

    (phi_m.to_degrees(), normalize_longitude(lambda_m.to_degrees()))
}

/// Wrap a longitude into [-180, 180]
#[inline]
pub fn normalize_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    ((lon + 180.0) % 360.0 + 360.0) % 360.0 - 180.0
}

/// Build a bounding box around `center` (x = lng, y = lat) extending by the given deltas
///
/// A negative longitude delta is a span that wrapped the antimeridian; 360° is added
/// before computing the east/west extents.
pub fn region_to_bbox(center: Point<f64>, lat_delta: f64, lng_delta: f64) -> BBox {
    let lng_delta = if lng_delta < 0.0 {
        lng_delta + 360.0
    } else {
        lng_delta
    };

    Rect::new(
        Coord {
            x: center.x() - lng_delta,
            y: center.y() - lat_delta,
        },
        Coord {
            x: center.x() + lng_delta,
            y: center.y() + lat_delta,
        },
    )
}

/// Integer zoom level for a latitude span: `round(log2(360 / latitude_delta))`
pub fn zoom_level(latitude_delta: f64) -> i32 {
    if !latitude_delta.is_finite() || latitude_delta <= 0.0 {
        return MAX_REPRESENTABLE_ZOOM;
    }
    ((360.0 / latitude_delta).log2().round() as i32).min(MAX_REPRESENTABLE_ZOOM)
}

/// Smallest box containing both anchors
#[inline]
pub fn bbox_from_anchors(a: Point<f64>, b: Point<f64>) -> BBox {
    Rect::new(a.0, b.0)
}

/// Flatten a box into `[minLng, minLat, maxLng, maxLat]`
#[inline]
pub fn bbox_to_array(bbox: &BBox) -> [f64; 4] {
    [bbox.min().x, bbox.min().y, bbox.max().x, bbox.max().y]
}

/// Whether a (lat, lon) pair is a usable WGS84 coordinate
#[inline]
pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Convert WGS84 (lat, lon) to Web Mercator (x, y) in meters
///
/// Latitude is clamped to the Web Mercator range.
#[inline(always)]
pub fn wgs84_to_mercator(lat: f64, lon: f64) -> Point<f64> {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);

    let x = lon * LON_TO_X_FACTOR;
    let lat_rad = lat.to_radians();
    let y = (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() * Y_FACTOR;

    Point::new(x, y)
}

/// Convert Web Mercator (x, y) in meters to WGS84, returned as (lat, lon)
#[inline(always)]
pub fn mercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lon = x * X_TO_LON_FACTOR;
    let lat =
        (std::f64::consts::PI / 2.0 - 2.0 * ((-y * Y_TO_LAT_FACTOR).exp()).atan()).to_degrees();
    (lat, lon)
}

/// Longitude to the unit square x coordinate (0 = 180°W, 1 = 180°E)
#[inline(always)]
pub fn lng_to_unit_x(lng: f64) -> f64 {
    lng / 360.0 + 0.5
}

/// Latitude to the unit square y coordinate (0 = north edge, 1 = south edge)
#[inline(always)]
pub fn lat_to_unit_y(lat: f64) -> f64 {
    let y = wgs84_to_mercator(lat, 0.0).y();
    (0.5 - y / EARTH_SIZE_METERS).clamp(0.0, 1.0)
}

/// Inverse of [`lng_to_unit_x`]
#[inline(always)]
pub fn unit_x_to_lng(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

/// Inverse of [`lat_to_unit_y`]
#[inline(always)]
pub fn unit_y_to_lat(y: f64) -> f64 {
    mercator_to_wgs84(0.0, (0.5 - y) * EARTH_SIZE_METERS).0
}
