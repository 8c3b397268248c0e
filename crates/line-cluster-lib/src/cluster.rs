//! Hierarchical radius clustering index
//!
//! The index is built once per filtered entity set, from the maximum zoom downward. Each
//! level holds the nodes visible at that integer zoom: the raw leaves for levels above
//! `max_zoom`, and for every lower zoom the result of greedily merging the nodes of the
//! level above that lie within `radius` pixels of each other. Positions live in the Web
//! Mercator unit square, so a constant pixel radius means the same merge distance at any
//! latitude on screen.

use crate::rebuild::CancellationToken;
use crate::{ClusterError, Entity, EntityId, RenderFeature, Result, utils};
use geo::Point;
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Source of build numbers; every build gets a fresh one so ids never collide across builds
static NEXT_BUILD: AtomicU64 = AtomicU64::new(1);

/// Tunables of the clustering algorithm
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClusterOptions {
    /// Merge radius in screen pixels
    pub radius: f64,
    /// Tile extent in pixels used to scale the unit square at each zoom
    pub extent: f64,
    /// Lowest zoom level that gets its own clustered level
    pub min_zoom: u8,
    /// Highest zoom level that still clusters; deeper zooms show raw leaves
    pub max_zoom: u8,
    /// Minimum number of points needed to form a cluster
    pub min_points: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            radius: 50.0,
            extent: 512.0,
            min_zoom: 0,
            max_zoom: 25,
            min_points: 2,
        }
    }
}

impl ClusterOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "cluster radius must be positive, got {}",
                self.radius
            )));
        }
        if !self.extent.is_finite() || self.extent <= 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "tile extent must be positive, got {}",
                self.extent
            )));
        }
        if self.min_zoom > self.max_zoom {
            return Err(ClusterError::InvalidConfig(format!(
                "min zoom {} is above max zoom {}",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.max_zoom > 30 {
            return Err(ClusterError::InvalidConfig(format!(
                "max zoom {} exceeds 30",
                self.max_zoom
            )));
        }
        if self.min_points < 2 {
            return Err(ClusterError::InvalidConfig(
                "min points must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge radius in unit-square coordinates at the given zoom
    #[inline]
    fn unit_radius(&self, zoom: u8) -> f64 {
        self.radius / (self.extent * 2f64.powi(zoom as i32))
    }

    /// Grid cell size for the level served at `zoom`
    ///
    /// The level is searched with the merge radius of the next lower zoom, which is twice
    /// its own, so a 3x3 cell neighborhood always covers the search circle.
    #[inline]
    fn cell_size(&self, zoom: u8) -> f64 {
        self.unit_radius(zoom) * 2.0
    }
}

/// Identifier of a cluster, valid only for the build that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterId {
    pub(crate) build: u64,
    pub(crate) slot: u32,
}

impl ClusterId {
    /// Build number of the index this id belongs to
    #[inline]
    pub fn build(&self) -> u64 {
        self.build
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.build, self.slot)
    }
}

/// Snapshot of one cluster, including its leaves in index order
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterNode {
    pub id: ClusterId,
    /// Weighted centroid, x = longitude and y = latitude
    pub centroid: Point<f64>,
    pub point_count: usize,
    pub expansion_zoom: u8,
    pub leaf_ids: Vec<EntityId>,
}

/// Entity data carried by the index for leaf rendering
#[derive(Debug, Clone)]
struct IndexedLeaf {
    entity_id: EntityId,
    primary: Point<f64>,
    secondary: Option<Point<f64>>,
    label: Point<f64>,
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Member {
    Leaf(u32),
    Cluster(u32),
}

#[derive(Debug, Clone)]
struct ClusterRecord {
    x: f64,
    y: f64,
    count: u32,
    expansion_zoom: u8,
    children: SmallVec<[Member; 4]>,
}

#[derive(Debug, Clone, Copy)]
struct LevelEntry {
    x: f64,
    y: f64,
    count: u32,
    member: Member,
}

/// Uniform hash grid over the entries of one level
#[derive(Debug)]
struct Grid {
    cell: f64,
    cells: HashMap<(i64, i64), Vec<u32>>,
}

impl Grid {
    fn new(entries: &[LevelEntry], cell: f64) -> Self {
        let mut cells: HashMap<(i64, i64), Vec<u32>> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            cells
                .entry(Self::key(entry.x, entry.y, cell))
                .or_default()
                .push(i as u32);
        }
        Self { cell, cells }
    }

    #[inline]
    fn key(x: f64, y: f64, cell: f64) -> (i64, i64) {
        ((x / cell).floor() as i64, (y / cell).floor() as i64)
    }

    /// Indices of entries within `r` of (x, y), ascending. Requires `r <= cell`.
    fn within(&self, entries: &[LevelEntry], x: f64, y: f64, r: f64, out: &mut Vec<u32>) {
        out.clear();
        let (cx, cy) = Self::key(x, y, self.cell);
        let r2 = r * r;
        for gx in cx - 1..=cx + 1 {
            for gy in cy - 1..=cy + 1 {
                let Some(bucket) = self.cells.get(&(gx, gy)) else {
                    continue;
                };
                for &i in bucket {
                    let e = &entries[i as usize];
                    let (dx, dy) = (e.x - x, e.y - y);
                    if dx * dx + dy * dy <= r2 {
                        out.push(i);
                    }
                }
            }
        }
        out.sort_unstable();
    }

    /// Indices of entries inside the unit-space box, ascending
    fn range(
        &self,
        entries: &[LevelEntry],
        min: (f64, f64),
        max: (f64, f64),
        out: &mut Vec<u32>,
    ) {
        let inside = |e: &LevelEntry| e.x >= min.0 && e.x <= max.0 && e.y >= min.1 && e.y <= max.1;
        let (x0, y0) = Self::key(min.0, min.1, self.cell);
        let (x1, y1) = Self::key(max.0, max.1, self.cell);
        let cell_count = ((x1 - x0 + 1) as f64) * ((y1 - y0 + 1) as f64);

        let start = out.len();
        if cell_count > self.cells.len() as f64 {
            // Visiting occupied cells is cheaper than walking the box
            for bucket in self.cells.values() {
                out.extend(
                    bucket
                        .iter()
                        .copied()
                        .filter(|&i| inside(&entries[i as usize])),
                );
            }
        } else {
            for gx in x0..=x1 {
                for gy in y0..=y1 {
                    if let Some(bucket) = self.cells.get(&(gx, gy)) {
                        out.extend(
                            bucket
                                .iter()
                                .copied()
                                .filter(|&i| inside(&entries[i as usize])),
                        );
                    }
                }
            }
        }
        out[start..].sort_unstable();
    }
}

/// All nodes visible at one zoom level
#[derive(Debug)]
struct Level {
    entries: Vec<LevelEntry>,
    grid: Grid,
}

impl Level {
    fn new(entries: Vec<LevelEntry>, cell: f64) -> Self {
        let grid = Grid::new(&entries, cell);
        Self { entries, grid }
    }
}

/// Hierarchical cluster index over one filtered entity set
#[derive(Debug)]
pub struct ClusterIndex {
    build: u64,
    options: ClusterOptions,
    leaves: Vec<IndexedLeaf>,
    clusters: Vec<ClusterRecord>,
    /// `levels[i]` serves zoom `min_zoom + i`; the last level holds the raw leaves
    levels: Vec<Level>,
    skipped: usize,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl ClusterIndex {
    /// Build an index over the entities' primary anchors
    ///
    /// Entities without a valid primary anchor are excluded, never an error.
    pub fn build(entities: &[Arc<Entity>], options: ClusterOptions) -> Result<Self> {
        Self::build_cancellable(entities, options, &CancellationToken::new())
    }

    /// Build an index, giving up with [`ClusterError::Cancelled`] once `token` is cancelled
    pub fn build_cancellable(
        entities: &[Arc<Entity>],
        options: ClusterOptions,
        token: &CancellationToken,
    ) -> Result<Self> {
        #[cfg(feature = "profiling")]
        profiling::scope!("cluster::build");

        options.validate()?;

        // Project in parallel, order is preserved by collect
        let projected: Vec<Option<IndexedLeaf>> = entities
            .par_iter()
            .map(|entity| Self::project(entity))
            .collect();

        let total = projected.len();
        let leaves: Vec<IndexedLeaf> = projected.into_iter().flatten().collect();
        let skipped = total - leaves.len();
        if skipped > 0 {
            tracing::warn!(
                "Excluded {} entities without a valid primary anchor from the cluster index",
                skipped
            );
        }

        let entries: Vec<LevelEntry> = leaves
            .iter()
            .enumerate()
            .map(|(i, leaf)| LevelEntry {
                x: leaf.x,
                y: leaf.y,
                count: 1,
                member: Member::Leaf(i as u32),
            })
            .collect();

        let level_count = (options.max_zoom - options.min_zoom) as usize + 2;
        let mut levels_top_down: Vec<Level> = Vec::with_capacity(level_count);
        let mut clusters: Vec<ClusterRecord> = Vec::new();
        let mut current = Level::new(
            entries,
            options.cell_size(options.max_zoom.saturating_add(1)),
        );

        for zoom in (options.min_zoom..=options.max_zoom).rev() {
            if token.is_cancelled() {
                tracing::debug!("Cluster build cancelled at zoom {}", zoom);
                return Err(ClusterError::Cancelled);
            }

            let radius = options.unit_radius(zoom);
            let next = Self::cluster_level(&current, radius, zoom, &options, &mut clusters);
            let level = Level::new(next, options.cell_size(zoom));
            levels_top_down.push(std::mem::replace(&mut current, level));
        }

        levels_top_down.push(current);
        levels_top_down.reverse();

        let build = NEXT_BUILD.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Built cluster index #{} with {} leaves and {} clusters",
            build,
            leaves.len(),
            clusters.len()
        );

        Ok(Self {
            build,
            options,
            leaves,
            clusters,
            levels: levels_top_down,
            skipped,
        })
    }

    fn project(entity: &Entity) -> Option<IndexedLeaf> {
        let primary = entity.primary_anchor?;
        let label = entity.midpoint().unwrap_or(primary);
        Some(IndexedLeaf {
            entity_id: entity.id.clone(),
            primary,
            secondary: entity.secondary_anchor,
            label,
            x: utils::lng_to_unit_x(primary.x()),
            y: utils::lat_to_unit_y(primary.y()),
        })
    }

    /// Greedily merge the nodes of `previous` that lie within `radius` of each other
    fn cluster_level(
        previous: &Level,
        radius: f64,
        zoom: u8,
        options: &ClusterOptions,
        clusters: &mut Vec<ClusterRecord>,
    ) -> Vec<LevelEntry> {
        let entries = &previous.entries;
        let mut visited = vec![false; entries.len()];
        let mut next = Vec::with_capacity(entries.len());
        let mut neighbors = Vec::new();
        let expansion_zoom = zoom.saturating_add(1).min(options.max_zoom);

        for i in 0..entries.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let seed = entries[i];

            previous
                .grid
                .within(entries, seed.x, seed.y, radius, &mut neighbors);
            neighbors.retain(|&j| !visited[j as usize]);

            let count: u32 = seed.count
                + neighbors
                    .iter()
                    .map(|&j| entries[j as usize].count)
                    .sum::<u32>();

            if neighbors.is_empty() || (count as usize) < options.min_points {
                next.push(seed);
                continue;
            }

            let mut wx = seed.x * seed.count as f64;
            let mut wy = seed.y * seed.count as f64;
            let mut children: SmallVec<[Member; 4]> = SmallVec::new();
            children.push(seed.member);

            for &j in &neighbors {
                visited[j as usize] = true;
                let n = entries[j as usize];
                wx += n.x * n.count as f64;
                wy += n.y * n.count as f64;
                children.push(n.member);
            }

            let record = ClusterRecord {
                x: wx / count as f64,
                y: wy / count as f64,
                count,
                expansion_zoom,
                children,
            };
            next.push(LevelEntry {
                x: record.x,
                y: record.y,
                count,
                member: Member::Cluster(clusters.len() as u32),
            });
            clusters.push(record);
        }

        next
    }

    /// Build number; differs between any two builds
    #[inline]
    pub fn build_number(&self) -> u64 {
        self.build
    }

    #[inline]
    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Number of indexed leaves
    #[inline]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Number of input entities excluded for lacking a valid primary anchor
    #[inline]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Integer zoom level actually served for a camera zoom
    #[inline]
    pub fn level_zoom(&self, zoom: f64) -> u8 {
        let max = self.options.max_zoom as f64 + 1.0;
        let min = self.options.min_zoom as f64;
        let zoom = if zoom.is_nan() { min } else { zoom.floor() };
        zoom.clamp(min, max) as u8
    }

    fn level(&self, zoom: f64) -> &Level {
        let i = (self.level_zoom(zoom) - self.options.min_zoom) as usize;
        &self.levels[i]
    }

    /// Sum of point counts over every node at the given zoom
    pub fn total_point_count(&self, zoom: f64) -> usize {
        self.level(zoom)
            .entries
            .iter()
            .map(|e| e.count as usize)
            .sum()
    }

    /// Append the features at `zoom` whose position falls inside the unit-space box
    pub(crate) fn features_in(
        &self,
        zoom: f64,
        min: (f64, f64),
        max: (f64, f64),
        out: &mut Vec<RenderFeature>,
    ) {
        let level = self.level(zoom);
        let mut hits = Vec::new();
        level.grid.range(&level.entries, min, max, &mut hits);
        out.extend(
            hits.into_iter()
                .map(|i| self.feature(level.entries[i as usize].member)),
        );
    }

    fn feature(&self, member: Member) -> RenderFeature {
        match member {
            Member::Leaf(i) => {
                let leaf = &self.leaves[i as usize];
                RenderFeature::Leaf {
                    entity_id: leaf.entity_id.clone(),
                    primary_anchor: leaf.primary,
                    secondary_anchor: leaf.secondary,
                    label_anchor: leaf.label,
                }
            }
            Member::Cluster(i) => {
                let record = &self.clusters[i as usize];
                RenderFeature::Cluster {
                    id: self.cluster_id(i),
                    centroid: Self::unit_to_point(record.x, record.y),
                    point_count: record.count as usize,
                    expansion_zoom: record.expansion_zoom,
                }
            }
        }
    }

    #[inline]
    fn cluster_id(&self, slot: u32) -> ClusterId {
        ClusterId {
            build: self.build,
            slot,
        }
    }

    #[inline]
    fn unit_to_point(x: f64, y: f64) -> Point<f64> {
        Point::new(utils::unit_x_to_lng(x), utils::unit_y_to_lat(y))
    }

    fn record(&self, id: ClusterId) -> Result<&ClusterRecord> {
        if id.build != self.build {
            return Err(ClusterError::StaleCluster(id));
        }
        self.clusters
            .get(id.slot as usize)
            .ok_or(ClusterError::StaleCluster(id))
    }

    /// Full snapshot of a cluster, or [`ClusterError::StaleCluster`] for foreign ids
    pub fn resolve_cluster(&self, id: ClusterId) -> Result<ClusterNode> {
        let record = self.record(id)?;
        Ok(ClusterNode {
            id,
            centroid: Self::unit_to_point(record.x, record.y),
            point_count: record.count as usize,
            expansion_zoom: record.expansion_zoom,
            leaf_ids: self.collect_leaves(record),
        })
    }

    /// Same as [`Self::resolve_cluster`], `None` for stale ids
    pub fn cluster(&self, id: ClusterId) -> Option<ClusterNode> {
        self.resolve_cluster(id).ok()
    }

    pub fn expansion_zoom(&self, id: ClusterId) -> Option<u8> {
        self.record(id).ok().map(|r| r.expansion_zoom)
    }

    /// Leaf entity ids below a cluster, depth-first in merge order
    pub fn leaves(&self, id: ClusterId) -> Option<Vec<EntityId>> {
        self.record(id).ok().map(|r| self.collect_leaves(r))
    }

    /// Direct children of a cluster as render features
    pub fn children(&self, id: ClusterId) -> Option<Vec<RenderFeature>> {
        let record = self.record(id).ok()?;
        Some(record.children.iter().map(|&m| self.feature(m)).collect())
    }

    fn collect_leaves(&self, record: &ClusterRecord) -> Vec<EntityId> {
        let mut out = Vec::with_capacity(record.count as usize);
        let mut stack: Vec<Member> = record.children.iter().rev().copied().collect();
        while let Some(member) = stack.pop() {
            match member {
                Member::Leaf(i) => out.push(self.leaves[i as usize].entity_id.clone()),
                Member::Cluster(i) => {
                    stack.extend(self.clusters[i as usize].children.iter().rev().copied())
                }
            }
        }
        out
    }
}
