//! Cell extents and the importer's greedy sub-extent packer.
//!
//! Pass 2 of the import partitions the input's cell rectangle into
//! sub-extents whose accumulated node count stays within a budget, bounding
//! the working set of each conversion slice. The packer is deterministic:
//! identical density maps always produce identical extents, which keeps
//! repeated imports byte-identical.

use std::collections::{HashMap, HashSet};

use super::CellIndex;

/// Inclusive rectangle of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellExtent {
    pub min: CellIndex,
    pub max: CellIndex,
}

impl CellExtent {
    pub fn point(cell: CellIndex) -> Self {
        Self { min: cell, max: cell }
    }

    pub fn contains(&self, cell: CellIndex) -> bool {
        cell.x >= self.min.x && cell.x <= self.max.x && cell.y >= self.min.y && cell.y <= self.max.y
    }

    /// Grow to include a cell.
    pub fn extend(&mut self, cell: CellIndex) {
        self.min.x = self.min.x.min(cell.x);
        self.min.y = self.min.y.min(cell.y);
        self.max.x = self.max.x.max(cell.x);
        self.max.y = self.max.y.max(cell.y);
    }

    pub fn width(&self) -> i64 {
        (self.max.x as i64) - (self.min.x as i64) + 1
    }

    pub fn height(&self) -> i64 {
        (self.max.y as i64) - (self.min.y as i64) + 1
    }

    pub fn cell_count(&self) -> i64 {
        self.width() * self.height()
    }

    /// Iterate cells row-major: y outer from min, x inner from min.
    pub fn cells(&self) -> impl Iterator<Item = CellIndex> {
        let (min, max) = (self.min, self.max);
        (min.y..=max.y).flat_map(move |y| (min.x..=max.x).map(move |x| CellIndex { x, y }))
    }
}

/// Partition `bounds` into sub-extents whose node counts stay within
/// `budget`. Cells absent from `counts` hold zero nodes; a single cell over
/// budget becomes its own extent. Every cell of `bounds` lands in exactly one
/// extent.
///
/// Greedy: start at the first unprocessed cell in row-major order and grow
/// the rectangle right or up, whichever adds more cells, while all added
/// cells are unprocessed and the sum stays within budget. Ties grow right.
pub fn pack_extents(
    counts: &HashMap<CellIndex, u64>,
    bounds: CellExtent,
    budget: u64,
) -> Vec<CellExtent> {
    let count_of = |cell: CellIndex| counts.get(&cell).copied().unwrap_or(0);

    let mut processed: HashSet<CellIndex> = HashSet::new();
    let mut extents = Vec::new();

    // Row-major cursor; every cell behind it is already processed, so the
    // lower-left unprocessed cell is always ahead of it.
    let mut scan = bounds.cells();

    loop {
        let start = match scan.by_ref().find(|c| !processed.contains(c)) {
            Some(c) => c,
            None => break,
        };

        let mut extent = CellExtent::point(start);
        let mut sum = count_of(start);

        if sum <= budget {
            loop {
                let grow_x = extent.max.x < bounds.max.x;
                let grow_y = extent.max.y < bounds.max.y;

                // Cost and feasibility of adding the next column to the right.
                let x_step = grow_x.then(|| {
                    let x = extent.max.x + 1;
                    let cells: Vec<CellIndex> = (extent.min.y..=extent.max.y)
                        .map(|y| CellIndex { x, y })
                        .collect();
                    (cells.iter().map(|&c| count_of(c)).sum::<u64>(), cells)
                });
                let x_ok = x_step.as_ref().is_some_and(|(cost, cells)| {
                    sum + cost <= budget && cells.iter().all(|c| !processed.contains(c))
                });

                // Cost and feasibility of adding the next row above.
                let y_step = grow_y.then(|| {
                    let y = extent.max.y + 1;
                    let cells: Vec<CellIndex> = (extent.min.x..=extent.max.x)
                        .map(|x| CellIndex { x, y })
                        .collect();
                    (cells.iter().map(|&c| count_of(c)).sum::<u64>(), cells)
                });
                let y_ok = y_step.as_ref().is_some_and(|(cost, cells)| {
                    sum + cost <= budget && cells.iter().all(|c| !processed.contains(c))
                });

                // Choose the feasible growth adding more cells; ties grow x.
                let grow_in_x = match (x_ok, y_ok) {
                    (true, true) => extent.height() >= extent.width(),
                    (true, false) => true,
                    (false, true) => false,
                    (false, false) => break,
                };

                let (cost, _) = if grow_in_x {
                    extent.max.x += 1;
                    x_step.unwrap()
                } else {
                    extent.max.y += 1;
                    y_step.unwrap()
                };
                sum += cost;
            }
        }
        // A start cell already over budget is emitted alone.

        for cell in extent.cells() {
            processed.insert(cell);
        }
        extents.push(extent);
    }

    extents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(x: i32, y: i32) -> CellIndex {
        CellIndex { x, y }
    }

    fn counts(entries: &[(i32, i32, u64)]) -> HashMap<CellIndex, u64> {
        entries.iter().map(|&(x, y, n)| (cell(x, y), n)).collect()
    }

    fn covers_exactly_once(extents: &[CellExtent], bounds: CellExtent) {
        for c in bounds.cells() {
            let owners = extents.iter().filter(|e| e.contains(c)).count();
            assert_eq!(owners, 1, "cell {:?} owned by {} extents", c, owners);
        }
    }

    #[test]
    fn test_everything_fits_one_extent() {
        let bounds = CellExtent {
            min: cell(0, 0),
            max: cell(3, 2),
        };
        let density = counts(&[(0, 0, 10), (3, 2, 20)]);
        let extents = pack_extents(&density, bounds, 1000);
        assert_eq!(extents, vec![bounds]);
    }

    #[test]
    fn test_budget_splits_extents() {
        let bounds = CellExtent {
            min: cell(0, 0),
            max: cell(1, 0),
        };
        let density = counts(&[(0, 0, 6), (1, 0, 6)]);
        let extents = pack_extents(&density, bounds, 10);
        assert_eq!(extents.len(), 2);
        covers_exactly_once(&extents, bounds);
    }

    #[test]
    fn test_over_budget_cell_is_singleton() {
        let bounds = CellExtent {
            min: cell(0, 0),
            max: cell(1, 1),
        };
        let density = counts(&[(0, 0, 500), (1, 0, 1), (0, 1, 1), (1, 1, 1)]);
        let extents = pack_extents(&density, bounds, 100);
        assert_eq!(extents[0], CellExtent::point(cell(0, 0)));
        covers_exactly_once(&extents, bounds);
    }

    #[test]
    fn test_packer_is_deterministic() {
        let bounds = CellExtent {
            min: cell(-2, -2),
            max: cell(4, 3),
        };
        let density = counts(&[(-2, -2, 7), (0, 0, 9), (4, 3, 3), (2, 1, 8)]);
        let a = pack_extents(&density, bounds, 12);
        let b = pack_extents(&density, bounds, 12);
        assert_eq!(a, b);
        covers_exactly_once(&a, bounds);
    }

    #[test]
    fn test_empty_cells_still_covered() {
        let bounds = CellExtent {
            min: cell(0, 0),
            max: cell(5, 5),
        };
        let extents = pack_extents(&HashMap::new(), bounds, 1);
        covers_exactly_once(&extents, bounds);
    }

    #[test]
    fn test_extent_cells_row_major() {
        let e = CellExtent {
            min: cell(0, 0),
            max: cell(1, 1),
        };
        let cells: Vec<CellIndex> = e.cells().collect();
        assert_eq!(
            cells,
            vec![cell(0, 0), cell(1, 0), cell(0, 1), cell(1, 1)]
        );
    }
}
