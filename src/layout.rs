//! Grid layout for the composite frame.
//!
//! The composite is a virtual grid of fixed-size cells. Cells are not used in
//! row-major order: they are handed out in a precomputed sequence chosen so
//! that, at every population level, the bounding rectangle of the occupied
//! cells stays as close as possible to a target display aspect ratio. The
//! sequence starts from a 1x1 grid and repeatedly expands by one column or
//! one row, whichever lands nearer the target ratio; ties expand by a
//! column.
//!
//! For the default 9 cells of 320x240 steered toward 16:9 the sequence is
//! `(0,0) (0,1) (1,0) (1,1) (0,2) (1,2) (2,0) (2,1) (2,2)`: two publishers
//! sit side by side, four make a 2x2 square, and so on up to the full 3x3.

/// A cell in the composite grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub row: u32,
    pub col: u32,
}

/// Top-left pixel of a cell inside the composite frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub x: i32,
    pub y: i32,
}

/// Precomputed slot-to-cell assignment, fixed at startup.
///
/// Slot `k` always maps to the same cell and pixel origin; which slots are
/// occupied at a given moment is the slot pool's business, not the layout's.
#[derive(Debug, Clone)]
pub struct GridLayout {
    cells: Vec<Cell>,
    origins: Vec<Origin>,
    cell_width: u32,
    cell_height: u32,
}

impl GridLayout {
    /// Compute the cell sequence for `capacity` slots of
    /// `cell_width` x `cell_height` pixels, steering the occupied rectangle
    /// toward `target_aspect` (width / height).
    pub fn new(capacity: usize, cell_width: u32, cell_height: u32, target_aspect: f32) -> Self {
        let mut cells = Vec::with_capacity(capacity);
        cells.push(Cell { row: 0, col: 0 });
        let mut rows = 1u32;
        let mut cols = 1u32;
        while ((rows * cols) as usize) < capacity {
            let wider =
                ((cell_width * (cols + 1)) as f32 / (cell_height * rows) as f32 - target_aspect)
                    .abs();
            let taller =
                ((cell_width * cols) as f32 / (cell_height * (rows + 1)) as f32 - target_aspect)
                    .abs();
            if wider <= taller {
                cols += 1;
                for row in 0..rows {
                    cells.push(Cell { row, col: cols - 1 });
                }
            } else {
                rows += 1;
                for col in 0..cols {
                    cells.push(Cell { row: rows - 1, col });
                }
            }
        }
        cells.truncate(capacity);

        let origins = cells
            .iter()
            .map(|cell| Origin {
                x: (cell_width * cell.col) as i32,
                y: (cell_height * cell.row) as i32,
            })
            .collect();

        Self {
            cells,
            origins,
            cell_width,
            cell_height,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_width(&self) -> u32 {
        self.cell_width
    }

    pub fn cell_height(&self) -> u32 {
        self.cell_height
    }

    /// The grid cell a slot draws into.
    pub fn cell(&self, slot: usize) -> Cell {
        self.cells[slot]
    }

    /// Pixel origin of a slot's cell.
    pub fn origin(&self, slot: usize) -> Origin {
        self.origins[slot]
    }

    /// Smallest `(rows, cols)` rectangle covering the given slots.
    ///
    /// An empty slot set yields `(1, 1)`: the composite never shrinks below
    /// one cell.
    pub fn extent(&self, slots: impl Iterator<Item = usize>) -> (u32, u32) {
        let mut max_row = 0;
        let mut max_col = 0;
        for slot in slots {
            let cell = self.cells[slot];
            max_row = max_row.max(cell.row);
            max_col = max_col.max(cell.col);
        }
        (max_row + 1, max_col + 1)
    }

    /// Pixel size of the composite cropped to a grid extent.
    pub fn crop_size(&self, rows: u32, cols: u32) -> (u32, u32) {
        (self.cell_width * cols, self.cell_height * rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_layout() -> GridLayout {
        GridLayout::new(9, 320, 240, 16.0 / 9.0)
    }

    #[test]
    fn nine_cell_sequence_matches_16_9_growth() {
        let layout = default_layout();
        let expected = [
            (0, 0),
            (0, 1),
            (1, 0),
            (1, 1),
            (0, 2),
            (1, 2),
            (2, 0),
            (2, 1),
            (2, 2),
        ];
        for (slot, &(row, col)) in expected.iter().enumerate() {
            assert_eq!(layout.cell(slot), Cell { row, col }, "slot {slot}");
        }
    }

    #[test]
    fn all_cells_of_the_full_grid_appear_exactly_once() {
        let layout = default_layout();
        let mut seen = std::collections::HashSet::new();
        for slot in 0..layout.capacity() {
            let cell = layout.cell(slot);
            assert!(cell.row < 3 && cell.col < 3);
            assert!(seen.insert((cell.row, cell.col)), "duplicate cell {cell:?}");
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn origins_follow_cell_dimensions() {
        let layout = default_layout();
        for slot in 0..layout.capacity() {
            let cell = layout.cell(slot);
            let origin = layout.origin(slot);
            assert_eq!(origin.x, (cell.col * 320) as i32);
            assert_eq!(origin.y, (cell.row * 240) as i32);
        }
    }

    #[test]
    fn ties_expand_by_a_column() {
        // With square cells and a target of 1.25 the first expansion is a
        // dead tie: 2/1 and 1/2 both deviate by 0.75.
        let layout = GridLayout::new(2, 100, 100, 1.25);
        assert_eq!(layout.cell(1), Cell { row: 0, col: 1 });
    }

    #[test]
    fn extent_covers_assigned_slots() {
        let layout = default_layout();
        assert_eq!(layout.extent(std::iter::empty()), (1, 1));
        assert_eq!(layout.extent([0].into_iter()), (1, 1));
        assert_eq!(layout.extent([0, 1].into_iter()), (1, 2));
        assert_eq!(layout.extent([0, 1, 2, 3].into_iter()), (2, 2));
        assert_eq!(layout.extent((0..9).into_iter()), (3, 3));
    }

    #[test]
    fn extent_never_undershoots_population() {
        // rows * cols >= number of slots, for every prefix of the sequence.
        let layout = default_layout();
        for n in 1..=layout.capacity() {
            let (rows, cols) = layout.extent(0..n);
            assert!(
                (rows * cols) as usize >= n,
                "extent {rows}x{cols} cannot hold {n} slots"
            );
        }
    }

    #[test]
    fn crop_size_scales_with_extent() {
        let layout = default_layout();
        assert_eq!(layout.crop_size(1, 1), (320, 240));
        assert_eq!(layout.crop_size(2, 2), (640, 480));
        assert_eq!(layout.crop_size(3, 3), (960, 720));
    }
}
