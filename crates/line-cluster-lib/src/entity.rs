//! Entity storage module
//!
//! This module provides the `Entity` line-feature and the `EntityStore` snapshot that
//! holds the canonical copy of every entity. The store is never patched in place: each
//! external refresh produces a brand new snapshot.

use crate::utils;
use geo::Point;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifier of a line entity as delivered by the data feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EntityId(pub String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A geotagged line feature defined by two endpoint anchors
///
/// Anchors are `geo::Point`s with x = longitude and y = latitude. An anchor that was
/// missing or invalid in the feed is `None`; such entities stay listable but are never
/// placed in the spatial index.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub primary_anchor: Option<Point<f64>>,
    pub secondary_anchor: Option<Point<f64>>,
    pub status: String,
    pub is_favorite: bool,
    /// Length of the line in meters as reported by the feed
    pub length: f64,
}

impl Entity {
    /// Create an entity from (lat, lng) anchor pairs, discarding invalid coordinates
    pub fn new(
        id: impl Into<EntityId>,
        name: impl Into<String>,
        primary: (f64, f64),
        secondary: (f64, f64),
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            primary_anchor: anchor_from_lat_lng(primary.0, primary.1),
            secondary_anchor: anchor_from_lat_lng(secondary.0, secondary.1),
            status: String::new(),
            is_favorite: false,
            length: 0.0,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_favorite(mut self, is_favorite: bool) -> Self {
        self.is_favorite = is_favorite;
        self
    }

    pub fn with_length(mut self, length: f64) -> Self {
        self.length = length;
        self
    }

    /// Whether the entity can be placed in the spatial index
    #[inline]
    pub fn is_indexable(&self) -> bool {
        self.primary_anchor.is_some()
    }

    /// Anchors used when fitting the camera: both when available, else the valid one
    pub fn fit_anchors(&self) -> Option<(Point<f64>, Point<f64>)> {
        match (self.primary_anchor, self.secondary_anchor) {
            (Some(a), Some(b)) => Some((a, b)),
            (Some(a), None) | (None, Some(a)) => Some((a, a)),
            (None, None) => None,
        }
    }

    /// Label position: spherical midpoint of both anchors
    pub fn midpoint(&self) -> Option<Point<f64>> {
        let (a, b) = self.fit_anchors()?;
        let (lat, lng) = utils::midpoint(a.y(), a.x(), b.y(), b.x());
        Some(Point::new(lng, lat))
    }

    /// Great-circle distance between the two anchors in meters
    pub fn span_meters(&self) -> Option<f64> {
        let a = self.primary_anchor?;
        let b = self.secondary_anchor?;
        Some(utils::haversine_distance(a.y(), a.x(), b.y(), b.x()))
    }
}

#[inline]
fn anchor_from_lat_lng(lat: f64, lng: f64) -> Option<Point<f64>> {
    utils::is_valid_coordinate(lat, lng).then(|| Point::new(lng, lat))
}

/// Anchor as it appears in the feed; either coordinate may be missing
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// Entity as delivered by the external data feed (camelCase JSON)
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub primary_anchor: Option<AnchorRecord>,
    #[serde(default)]
    pub secondary_anchor: Option<AnchorRecord>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub length: f64,
}

#[cfg(feature = "serde")]
impl From<EntityRecord> for Entity {
    fn from(record: EntityRecord) -> Self {
        let anchor = |a: Option<AnchorRecord>| {
            let a = a?;
            anchor_from_lat_lng(a.lat?, a.lng?)
        };
        Self {
            id: EntityId(record.id),
            name: record.name,
            primary_anchor: anchor(record.primary_anchor),
            secondary_anchor: anchor(record.secondary_anchor),
            status: record.status,
            is_favorite: record.is_favorite,
            length: record.length,
        }
    }
}

/// Immutable snapshot of the canonical entity set
///
/// Cloning is cheap: the entity list and id lookup are shared.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: Arc<[Arc<Entity>]>,
    by_id: Arc<HashMap<EntityId, usize>>,
    revision: u64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl EntityStore {
    /// Build a snapshot from a full-replacement feed
    ///
    /// Duplicate ids keep their first occurrence. Entities without a usable primary anchor
    /// are kept (they remain searchable) but are logged because the index will skip them.
    pub fn new(entities: Vec<Entity>, revision: u64) -> Self {
        let mut by_id = HashMap::with_capacity(entities.len());
        let mut kept: Vec<Arc<Entity>> = Vec::with_capacity(entities.len());

        for entity in entities {
            if by_id.contains_key(&entity.id) {
                tracing::warn!("Skipping duplicate entity id {}", entity.id);
                continue;
            }
            if !entity.is_indexable() {
                tracing::warn!(
                    "Entity {} has no valid primary anchor and will not be clustered",
                    entity.id
                );
            }
            by_id.insert(entity.id.clone(), kept.len());
            kept.push(Arc::new(entity));
        }

        Self {
            entities: kept.into(),
            by_id: Arc::new(by_id),
            revision,
        }
    }

    /// Build a snapshot from raw feed records
    #[cfg(feature = "serde")]
    pub fn from_records(records: Vec<EntityRecord>, revision: u64) -> Self {
        Self::new(records.into_iter().map(Entity::from).collect(), revision)
    }

    /// Look up the canonical entity for an id
    #[inline]
    pub fn get(&self, id: &EntityId) -> Option<&Arc<Entity>> {
        self.by_id.get(id).and_then(|&i| self.entities.get(i))
    }

    /// Resolve an id, reporting a missing entity as an error
    pub fn resolve(&self, id: &EntityId) -> crate::Result<Arc<Entity>> {
        self.get(id)
            .cloned()
            .ok_or_else(|| crate::ClusterError::UnknownEntity(id.clone()))
    }

    #[inline]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.by_id.contains_key(id)
    }

    /// All entities in feed order
    #[inline]
    pub fn entities(&self) -> &[Arc<Entity>] {
        &self.entities
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Monotonic refresh counter assigned by the owner of the snapshot
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of entities that have a usable primary anchor
    pub fn indexable_count(&self) -> usize {
        self.entities.iter().filter(|e| e.is_indexable()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_entities() -> Vec<Entity> {
        vec![
            Entity::new("a", "Alpha ridge", (51.5, -0.12), (51.51, -0.1)),
            Entity::new("b", "Bravo canal", (48.85, 2.35), (48.86, 2.36)),
            Entity::new("c", "Broken", (f64::NAN, 0.0), (10.0, 10.0)),
        ]
    }

    #[test]
    fn test_store_lookup() {
        let store = EntityStore::new(create_test_entities(), 1);
        assert_eq!(store.len(), 3);
        assert_eq!(store.revision(), 1);
        assert_eq!(store.get(&EntityId::from("b")).unwrap().name, "Bravo canal");
        assert!(store.get(&EntityId::from("zzz")).is_none());
    }

    #[test]
    fn test_invalid_anchor_is_dropped() {
        let store = EntityStore::new(create_test_entities(), 1);
        let broken = store.get(&EntityId::from("c")).unwrap();
        assert!(broken.primary_anchor.is_none());
        assert!(broken.secondary_anchor.is_some());
        assert_eq!(store.indexable_count(), 2);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let mut entities = create_test_entities();
        entities.push(Entity::new("a", "Second alpha", (0.0, 0.0), (0.0, 0.0)));
        let store = EntityStore::new(entities, 1);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&EntityId::from("a")).unwrap().name, "Alpha ridge");
    }

    #[test]
    fn test_resolve_unknown() {
        let store = EntityStore::default();
        assert!(store.is_empty());
        assert!(matches!(
            store.resolve(&EntityId::from("x")),
            Err(crate::ClusterError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_fit_anchors_and_midpoint() {
        let entity = Entity::new("a", "A", (0.0, 0.0), (0.0, 2.0));
        let (a, b) = entity.fit_anchors().unwrap();
        assert_eq!(a, Point::new(0.0, 0.0));
        assert_eq!(b, Point::new(2.0, 0.0));

        let mid = entity.midpoint().unwrap();
        assert!((mid.x() - 1.0).abs() < 1e-9);
        assert!(mid.y().abs() < 1e-9);

        let span = entity.span_meters().unwrap();
        assert!(span > 222_000.0 && span < 223_000.0);
    }

    #[test]
    fn test_fit_anchors_single_valid() {
        let entity = Entity::new("a", "A", (1.0, 1.0), (f64::INFINITY, 0.0));
        let (a, b) = entity.fit_anchors().unwrap();
        assert_eq!(a, b);
        assert!(entity.span_meters().is_none());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_from_records() {
        let json = r#"[
            {"id": "1", "name": "One", "primaryAnchor": {"lat": 1.0, "lng": 2.0},
             "secondaryAnchor": {"lat": 1.5, "lng": 2.5}, "status": "open",
             "isFavorite": true, "length": 1200.0},
            {"id": "2", "name": "Two", "primaryAnchor": {"lat": null, "lng": 2.0}}
        ]"#;
        let records: Vec<EntityRecord> = serde_json::from_str(json).unwrap();
        let store = EntityStore::from_records(records, 7);

        let one = store.get(&EntityId::from("1")).unwrap();
        assert_eq!(one.primary_anchor, Some(Point::new(2.0, 1.0)));
        assert!(one.is_favorite);
        assert_eq!(one.status, "open");

        let two = store.get(&EntityId::from("2")).unwrap();
        assert!(two.primary_anchor.is_none());
        assert!(two.secondary_anchor.is_none());
    }
}
