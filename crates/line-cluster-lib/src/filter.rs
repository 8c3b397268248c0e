//! Search and category filtering of the entity store

use crate::{Entity, EntityStore};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Category selector values
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Category {
    #[default]
    All,
    Favorites,
    /// Entities whose status matches (case-insensitive)
    Status(String),
}

impl Category {
    #[inline]
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Category::All => true,
            Category::Favorites => entity.is_favorite,
            Category::Status(status) => entity.status.eq_ignore_ascii_case(status),
        }
    }
}

/// Combined search text and category predicate
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilterState {
    /// Free-text search, matched case-insensitively against name and id
    pub search_text: String,
    pub category: Category,
}

impl FilterState {
    pub fn new(search_text: impl Into<String>, category: Category) -> Self {
        Self {
            search_text: search_text.into(),
            category,
        }
    }

    /// Whether this filter lets every entity through
    #[inline]
    pub fn is_pass_through(&self) -> bool {
        self.search_text.trim().is_empty() && self.category == Category::All
    }

    /// Narrow the store to the matching entities, preserving store order
    pub fn apply(&self, store: &EntityStore) -> Vec<Arc<Entity>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("filter::apply");

        if self.is_pass_through() {
            return store.entities().to_vec();
        }

        let needle = self.search_text.trim().to_lowercase();
        store
            .entities()
            .iter()
            .filter(|entity| self.category.matches(entity))
            .filter(|entity| {
                needle.is_empty()
                    || entity.name.to_lowercase().contains(&needle)
                    || entity.id.as_str().to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }
}

/// Hash identifying a filtered entity set for index memoization
///
/// Covers ids and anchors so a refresh that moves an entity invalidates the key.
pub fn filtered_set_hash(entities: &[Arc<Entity>]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    entities.len().hash(&mut hasher);
    for entity in entities {
        entity.id.hash(&mut hasher);
        for anchor in [entity.primary_anchor, entity.secondary_anchor] {
            match anchor {
                Some(p) => {
                    p.x().to_bits().hash(&mut hasher);
                    p.y().to_bits().hash(&mut hasher);
                }
                None => 0u8.hash(&mut hasher),
            }
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> EntityStore {
        EntityStore::new(
            vec![
                Entity::new("r-1", "River Walk", (1.0, 1.0), (1.1, 1.1)).with_status("open"),
                Entity::new("r-2", "Harbour Line", (2.0, 2.0), (2.1, 2.1))
                    .with_status("closed")
                    .with_favorite(true),
                Entity::new("r-3", "Old river path", (3.0, 3.0), (3.1, 3.1))
                    .with_status("Open")
                    .with_favorite(true),
            ],
            1,
        )
    }

    fn ids(entities: &[Arc<Entity>]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_pass_through() {
        let store = create_test_store();
        let filter = FilterState::default();
        assert!(filter.is_pass_through());
        assert_eq!(ids(&filter.apply(&store)), vec!["r-1", "r-2", "r-3"]);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let store = create_test_store();
        let filter = FilterState::new("  RIVER ", Category::All);
        assert_eq!(ids(&filter.apply(&store)), vec!["r-1", "r-3"]);
    }

    #[test]
    fn test_search_matches_id() {
        let store = create_test_store();
        let filter = FilterState::new("r-2", Category::All);
        assert_eq!(ids(&filter.apply(&store)), vec!["r-2"]);
    }

    #[test]
    fn test_category_favorites() {
        let store = create_test_store();
        let filter = FilterState::new("", Category::Favorites);
        assert_eq!(ids(&filter.apply(&store)), vec!["r-2", "r-3"]);
    }

    #[test]
    fn test_combined_predicates() {
        let store = create_test_store();
        let filter = FilterState::new("river", Category::Status("open".into()));
        assert_eq!(ids(&filter.apply(&store)), vec!["r-1", "r-3"]);

        let filter = FilterState::new("harbour", Category::Status("open".into()));
        assert!(filter.apply(&store).is_empty());
    }

    #[test]
    fn test_filtered_set_hash() {
        let store = create_test_store();
        let all = FilterState::default().apply(&store);
        let favorites = FilterState::new("", Category::Favorites).apply(&store);

        assert_eq!(filtered_set_hash(&all), filtered_set_hash(&all.clone()));
        assert_ne!(filtered_set_hash(&all), filtered_set_hash(&favorites));

        let moved = EntityStore::new(
            vec![Entity::new("r-1", "River Walk", (1.5, 1.0), (1.1, 1.1))],
            2,
        );
        let original = EntityStore::new(
            vec![Entity::new("r-1", "River Walk", (1.0, 1.0), (1.1, 1.1))],
            1,
        );
        assert_ne!(
            filtered_set_hash(moved.entities()),
            filtered_set_hash(original.entities())
        );
    }
}
