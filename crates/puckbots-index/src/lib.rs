//! Spatial indexing primitives shared across the PuckBots workspace.
//!
//! Two uniform grids cover the torus: a coarse bucket grid used for
//! visibility queries, and a fine one-occupant-per-cell grid whose
//! membership doubles as the collision-exclusion mechanism. Both are
//! derived secondary indices: the entity arenas owned by the node remain
//! canonical storage, and the grids only hold keys into them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors emitted when constructing grid geometry.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used.
    #[error("invalid grid: {0}")]
    InvalidGrid(&'static str),
}

/// Identifies one square cell of a uniform grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId {
    pub col: u32,
    pub row: u32,
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.col, self.row)
    }
}

/// Geometry of a uniform square grid spanning the full torus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GridSpec {
    extent: f32,
    dims: u32,
    cell: f32,
}

impl GridSpec {
    /// Build a grid of `dims × dims` cells covering a torus of side `extent`.
    pub fn new(extent: f32, dims: u32) -> Result<Self, IndexError> {
        if !(extent > 0.0) || !extent.is_finite() {
            return Err(IndexError::InvalidGrid("extent must be positive and finite"));
        }
        if dims == 0 {
            return Err(IndexError::InvalidGrid("cell count must be non-zero"));
        }
        Ok(Self {
            extent,
            dims,
            cell: extent / dims as f32,
        })
    }

    /// Build the finest grid whose cells are at least `min_cell` wide.
    ///
    /// Used for the collision grid, whose cells must span one robot
    /// diameter: the largest dimension count is chosen such that
    /// `cell_size() >= min_cell` still holds.
    pub fn with_min_cell(extent: f32, min_cell: f32) -> Result<Self, IndexError> {
        if !(min_cell > 0.0) || !min_cell.is_finite() {
            return Err(IndexError::InvalidGrid("cell size must be positive and finite"));
        }
        if min_cell > extent {
            return Err(IndexError::InvalidGrid("cell size exceeds world extent"));
        }
        let dims = (extent / min_cell).floor() as u32;
        Self::new(extent, dims.max(1))
    }

    #[must_use]
    pub const fn dims(&self) -> u32 {
        self.dims
    }

    #[must_use]
    pub const fn extent(&self) -> f32 {
        self.extent
    }

    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell
    }

    #[must_use]
    pub const fn cell_count(&self) -> usize {
        (self.dims as usize) * (self.dims as usize)
    }

    /// Map a world position to its cell. Wrap-aware on both axes, so
    /// positions slightly outside `[0, extent)` (e.g. an unwrapped
    /// bounding-box corner) land on the correct torus cell.
    #[must_use]
    pub fn cell_of(&self, x: f32, y: f32) -> CellId {
        CellId {
            col: self.axis_cell(x),
            row: self.axis_cell(y),
        }
    }

    /// Map a possibly-negative cell coordinate onto the torus.
    #[must_use]
    pub fn wrap_axis(&self, raw: i64) -> u32 {
        let dims = i64::from(self.dims);
        (raw.rem_euclid(dims)) as u32
    }

    fn axis_cell(&self, v: f32) -> u32 {
        let folded = v.rem_euclid(self.extent);
        // rem_euclid can return `extent` itself when v is a tiny negative.
        let idx = (folded / self.cell) as u32;
        idx.min(self.dims - 1)
    }

    fn slot(&self, cell: CellId) -> usize {
        assert!(
            cell.col < self.dims && cell.row < self.dims,
            "cell {cell} out of range for {}x{} grid",
            self.dims,
            self.dims,
        );
        (cell.row as usize) * (self.dims as usize) + (cell.col as usize)
    }
}

/// Coarse grid mapping each cell to the unordered set of entities in it.
///
/// Keys are arena handles; the grid never owns the entities. Removing a
/// key from a cell that does not contain it is an invariant violation and
/// aborts with a diagnostic.
#[derive(Debug, Clone)]
pub struct BucketGrid<K> {
    spec: GridSpec,
    cells: Vec<Vec<K>>,
}

impl<K: Copy + Eq + fmt::Debug> BucketGrid<K> {
    #[must_use]
    pub fn new(spec: GridSpec) -> Self {
        Self {
            cells: vec![Vec::new(); spec.cell_count()],
            spec,
        }
    }

    #[must_use]
    pub const fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn insert(&mut self, cell: CellId, key: K) {
        let slot = self.spec.slot(cell);
        self.cells[slot].push(key);
    }

    pub fn remove(&mut self, cell: CellId, key: K) {
        let slot = self.spec.slot(cell);
        let bucket = &mut self.cells[slot];
        let Some(at) = bucket.iter().position(|k| *k == key) else {
            panic!("{key:?} not indexed in cell {cell}");
        };
        bucket.swap_remove(at);
    }

    /// Move `key` between cells; a same-cell move touches nothing.
    pub fn reindex(&mut self, old: CellId, new: CellId, key: K) {
        if old == new {
            return;
        }
        self.remove(old, key);
        self.insert(new, key);
    }

    #[must_use]
    pub fn occupants(&self, cell: CellId) -> &[K] {
        &self.cells[self.spec.slot(cell)]
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.cells {
            bucket.clear();
        }
    }
}

/// Occupant of one collision cell.
///
/// `Foreign` marks a shadow materialized from a neighbour strip's border
/// snapshot; it carries only a position, so shadows can never leak into
/// sensor indexing or hand-off bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellOccupant<K> {
    Local(K),
    Foreign { x: f32, y: f32 },
}

/// Fine grid holding at most one robot per cell.
///
/// Cell membership is the collision-exclusion mechanism itself: a move is
/// only committed into an empty cell, so double occupancy is a logic bug
/// and every mutation asserts the invariant.
#[derive(Debug, Clone)]
pub struct CollisionGrid<K> {
    spec: GridSpec,
    cells: Vec<Option<CellOccupant<K>>>,
}

impl<K: Copy + Eq + fmt::Debug> CollisionGrid<K> {
    #[must_use]
    pub fn new(spec: GridSpec) -> Self {
        Self {
            cells: vec![None; spec.cell_count()],
            spec,
        }
    }

    #[must_use]
    pub const fn spec(&self) -> &GridSpec {
        &self.spec
    }

    #[must_use]
    pub fn occupant(&self, cell: CellId) -> Option<&CellOccupant<K>> {
        self.cells[self.spec.slot(cell)].as_ref()
    }

    pub fn insert_local(&mut self, cell: CellId, key: K) {
        let slot = self.spec.slot(cell);
        match &self.cells[slot] {
            None => self.cells[slot] = Some(CellOccupant::Local(key)),
            Some(occupant) => {
                panic!("collision cell {cell} already holds {occupant:?}, cannot place {key:?}")
            }
        }
    }

    pub fn remove_local(&mut self, cell: CellId, key: K) {
        let slot = self.spec.slot(cell);
        match self.cells[slot].take() {
            Some(CellOccupant::Local(held)) if held == key => {}
            other => panic!("collision cell {cell} held {other:?}, expected {key:?}"),
        }
    }

    /// Move `key` between cells; a same-cell move touches nothing.
    pub fn reindex_local(&mut self, old: CellId, new: CellId, key: K) {
        if old == new {
            return;
        }
        self.remove_local(old, key);
        self.insert_local(new, key);
    }

    /// Materialize a shadow occupant. Returns whether the shadow was
    /// placed; an occupied cell keeps its occupant, which already blocks.
    pub fn place_foreign(&mut self, cell: CellId, x: f32, y: f32) -> bool {
        let slot = self.spec.slot(cell);
        if self.cells[slot].is_some() {
            return false;
        }
        self.cells[slot] = Some(CellOccupant::Foreign { x, y });
        true
    }

    pub fn clear_foreign(&mut self, cell: CellId) {
        let slot = self.spec.slot(cell);
        match self.cells[slot] {
            Some(CellOccupant::Foreign { .. }) => self.cells[slot] = None,
            ref other => panic!("collision cell {cell} held {other:?}, expected a shadow"),
        }
    }

    /// Visit the target cell and its 8 torus neighbours.
    ///
    /// Cell containment alone under-approximates circle overlap near cell
    /// boundaries, so callers run the geometric footprint test over this
    /// neighbourhood. On degenerate grids (fewer than 3 cells per axis)
    /// wrapped neighbours coincide; duplicates are skipped.
    pub fn neighborhood(&self, cell: CellId) -> impl Iterator<Item = (CellId, &CellOccupant<K>)> {
        let mut ids = [CellId { col: 0, row: 0 }; 9];
        let mut len = 0usize;
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                let id = CellId {
                    col: self.spec.wrap_axis(i64::from(cell.col) + dc),
                    row: self.spec.wrap_axis(i64::from(cell.row) + dr),
                };
                if !ids[..len].contains(&id) {
                    ids[len] = id;
                    len += 1;
                }
            }
        }
        ids.into_iter()
            .take(len)
            .filter_map(|id| self.occupant(id).map(|occupant| (id, occupant)))
    }

    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            *cell = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GridSpec {
        GridSpec::new(100.0, 10).expect("spec")
    }

    #[test]
    fn cell_of_is_deterministic_and_wraps() {
        let spec = spec();
        assert_eq!(spec.cell_size(), 10.0);
        assert_eq!(spec.cell_of(0.0, 0.0), CellId { col: 0, row: 0 });
        assert_eq!(spec.cell_of(99.9, 5.0), CellId { col: 9, row: 0 });
        // Just-outside positions fold back onto the torus.
        assert_eq!(spec.cell_of(-0.5, 105.0), CellId { col: 9, row: 0 });
        assert_eq!(spec.cell_of(100.0, -100.0), CellId { col: 0, row: 0 });
    }

    #[test]
    fn with_min_cell_never_undershoots() {
        let spec = GridSpec::with_min_cell(10.0, 0.3).expect("spec");
        assert_eq!(spec.dims(), 33);
        assert!(spec.cell_size() >= 0.3);

        let coarse = GridSpec::with_min_cell(1.0, 0.8).expect("spec");
        assert_eq!(coarse.dims(), 1);
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(GridSpec::new(0.0, 4).is_err());
        assert!(GridSpec::new(10.0, 0).is_err());
        assert!(GridSpec::with_min_cell(10.0, 0.0).is_err());
        assert!(GridSpec::with_min_cell(1.0, 2.0).is_err());
    }

    #[test]
    fn bucket_membership_roundtrip() {
        let mut grid: BucketGrid<u32> = BucketGrid::new(spec());
        let cell = CellId { col: 3, row: 4 };
        grid.insert(cell, 7);
        grid.insert(cell, 9);
        assert_eq!(grid.occupants(cell), &[7, 9]);
        grid.remove(cell, 7);
        assert_eq!(grid.occupants(cell), &[9]);
    }

    #[test]
    #[should_panic(expected = "not indexed")]
    fn bucket_remove_of_absent_key_aborts() {
        let mut grid: BucketGrid<u32> = BucketGrid::new(spec());
        grid.remove(CellId { col: 0, row: 0 }, 1);
    }

    #[test]
    fn bucket_reindex_same_cell_is_noop() {
        let mut grid: BucketGrid<u32> = BucketGrid::new(spec());
        let cell = CellId { col: 2, row: 2 };
        grid.insert(cell, 1);
        grid.insert(cell, 2);
        grid.reindex(cell, cell, 1);
        assert_eq!(grid.occupants(cell), &[1, 2]);
    }

    #[test]
    fn collision_cell_is_exclusive() {
        let mut grid: CollisionGrid<u32> = CollisionGrid::new(spec());
        let a = CellId { col: 1, row: 1 };
        let b = CellId { col: 1, row: 2 };
        grid.insert_local(a, 5);
        assert_eq!(grid.occupant(a), Some(&CellOccupant::Local(5)));
        grid.reindex_local(a, b, 5);
        assert!(grid.occupant(a).is_none());
        grid.remove_local(b, 5);
        assert!(grid.occupant(b).is_none());
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn collision_double_occupancy_aborts() {
        let mut grid: CollisionGrid<u32> = CollisionGrid::new(spec());
        let cell = CellId { col: 0, row: 0 };
        grid.insert_local(cell, 1);
        grid.insert_local(cell, 2);
    }

    #[test]
    #[should_panic(expected = "expected")]
    fn collision_remove_of_wrong_key_aborts() {
        let mut grid: CollisionGrid<u32> = CollisionGrid::new(spec());
        let cell = CellId { col: 0, row: 0 };
        grid.insert_local(cell, 1);
        grid.remove_local(cell, 2);
    }

    #[test]
    fn foreign_shadows_yield_to_existing_occupants() {
        let mut grid: CollisionGrid<u32> = CollisionGrid::new(spec());
        let cell = CellId { col: 4, row: 4 };
        grid.insert_local(cell, 3);
        assert!(!grid.place_foreign(cell, 41.0, 44.0));
        assert_eq!(grid.occupant(cell), Some(&CellOccupant::Local(3)));

        let open = CellId { col: 5, row: 4 };
        assert!(grid.place_foreign(open, 51.0, 44.0));
        grid.clear_foreign(open);
        assert!(grid.occupant(open).is_none());
    }

    #[test]
    fn neighborhood_covers_wrapped_cells_once() {
        let grid: CollisionGrid<u32> = CollisionGrid::new(spec());
        let corner = CellId { col: 0, row: 0 };
        let mut seen = Vec::new();
        let mut probe: CollisionGrid<u32> = grid.clone();
        // Occupy all nine wrapped neighbours of the corner cell.
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                let id = CellId {
                    col: probe.spec().wrap_axis(dc),
                    row: probe.spec().wrap_axis(dr),
                };
                probe.insert_local(id, (id.row * 10 + id.col) as u32);
            }
        }
        for (id, _) in probe.neighborhood(corner) {
            assert!(!seen.contains(&id), "cell {id} visited twice");
            seen.push(id);
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn neighborhood_deduplicates_on_tiny_grids() {
        let spec = GridSpec::new(4.0, 2).expect("spec");
        let mut grid: CollisionGrid<u32> = CollisionGrid::new(spec);
        for col in 0..2 {
            for row in 0..2 {
                grid.insert_local(CellId { col, row }, row * 2 + col);
            }
        }
        let visited: Vec<_> = grid.neighborhood(CellId { col: 0, row: 0 }).collect();
        assert_eq!(visited.len(), 4);
    }
}
