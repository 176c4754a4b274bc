use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Board side length for the supported puzzle domain.
pub const GRID_SIDE: usize = 9;

/// Total cell count of a board.
pub const GRID_CELLS: usize = GRID_SIDE * GRID_SIDE;

/// Largest legal cell value. `0` marks a blank cell.
pub const MAX_CELL_VALUE: u8 = 9;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("expected {GRID_SIDE} rows, got {0}")]
    WrongRowCount(usize),
    #[error("row {row} has {len} cells, expected {GRID_SIDE}")]
    WrongRowLength { row: usize, len: usize },
    #[error("expected {GRID_CELLS} cells, got {0}")]
    WrongCellCount(usize),
    #[error("cell ({row}, {col}) holds {value}, outside 0..={MAX_CELL_VALUE}")]
    CellOutOfRange { row: usize, col: usize, value: u8 },
}

/// A validated 9×9 puzzle board.
///
/// Cell values are `1..=9`; `0` marks a blank. Construction always goes
/// through a validating constructor, so a `Grid` in hand is proof that the
/// geometry and value ranges are correct. Serializes as nested rows
/// (`[[u8; 9]; 9]` in JSON), matching the boundary representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<u8>>", into = "Vec<Vec<u8>>")]
pub struct Grid {
    cells: [u8; GRID_CELLS],
}

impl Grid {
    /// Build a grid from nested rows, validating shape and cell range.
    pub fn from_rows(rows: &[Vec<u8>]) -> Result<Self, GridError> {
        if rows.len() != GRID_SIDE {
            return Err(GridError::WrongRowCount(rows.len()));
        }
        let mut cells = [0u8; GRID_CELLS];
        for (row, values) in rows.iter().enumerate() {
            if values.len() != GRID_SIDE {
                return Err(GridError::WrongRowLength {
                    row,
                    len: values.len(),
                });
            }
            for (col, &value) in values.iter().enumerate() {
                if value > MAX_CELL_VALUE {
                    return Err(GridError::CellOutOfRange { row, col, value });
                }
                cells[row * GRID_SIDE + col] = value;
            }
        }
        Ok(Self { cells })
    }

    /// Build a grid from a row-major flat slice of 81 cells.
    pub fn from_flat(cells: &[u8]) -> Result<Self, GridError> {
        if cells.len() != GRID_CELLS {
            return Err(GridError::WrongCellCount(cells.len()));
        }
        for (index, &value) in cells.iter().enumerate() {
            if value > MAX_CELL_VALUE {
                return Err(GridError::CellOutOfRange {
                    row: index / GRID_SIDE,
                    col: index % GRID_SIDE,
                    value,
                });
            }
        }
        let mut buf = [0u8; GRID_CELLS];
        buf.copy_from_slice(cells);
        Ok(Self { cells: buf })
    }

    #[must_use]
    pub fn cell(&self, row: usize, col: usize) -> u8 {
        self.cells[row * GRID_SIDE + col]
    }

    /// Row-major view of all cells.
    #[must_use]
    pub fn as_flat(&self) -> &[u8] {
        &self.cells
    }

    /// Iterate over the nine rows as slices.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        self.cells.chunks_exact(GRID_SIDE)
    }

    /// Number of non-blank cells.
    #[must_use]
    pub fn filled_cells(&self) -> usize {
        self.cells.iter().filter(|&&v| v != 0).count()
    }

    #[must_use]
    pub fn to_rows(&self) -> Vec<Vec<u8>> {
        self.rows().map(<[u8]>::to_vec).collect()
    }
}

impl TryFrom<Vec<Vec<u8>>> for Grid {
    type Error = GridError;

    fn try_from(rows: Vec<Vec<u8>>) -> Result<Self, Self::Error> {
        Self::from_rows(&rows)
    }
}

impl From<Grid> for Vec<Vec<u8>> {
    fn from(grid: Grid) -> Self {
        grid.to_rows()
    }
}

impl fmt::Display for Grid {
    /// Compact board rendering: digits for filled cells, `.` for blanks.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, row) in self.rows().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            for &cell in row {
                if cell == 0 {
                    write!(f, ".")?;
                } else {
                    write!(f, "{cell}")?;
                }
            }
        }
        Ok(())
    }
}
