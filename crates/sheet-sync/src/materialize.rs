//! Sparse-to-dense grid materialization.
//!
//! Pure functions only: nothing here mutates the store, and the same input
//! always yields the same frame.

use serde::{Deserialize, Serialize};

use crate::identity::SheetSnapshot;
use crate::store::CellStore;

/// Dense, rectangular view handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridFrame {
    /// Position in the session's frame sequence; 0 for a frame built outside
    /// a session.
    pub sequence: u64,
    pub rows: usize,
    pub cols: usize,
    /// `cells[row][col]`, empty string where nothing is stored.
    pub cells: Vec<Vec<String>>,
    pub column_labels: Vec<String>,
}

impl GridFrame {
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            rows: 0,
            cols: 0,
            cells: Vec::new(),
            column_labels: Vec::new(),
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.cells
            .get(row)
            .and_then(|cells| cells.get(col))
            .map(String::as_str)
    }
}

/// Base-26 spreadsheet column label: 0 -> `A`, 25 -> `Z`, 26 -> `AA`.
pub fn column_label(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

pub fn materialize(snapshot: &SheetSnapshot, min_rows: usize, min_cols: usize) -> GridFrame {
    materialize_cells(
        snapshot.records.iter().map(|record| {
            (
                record.identity.row,
                record.identity.col,
                record.value.as_str(),
            )
        }),
        min_rows,
        min_cols,
    )
}

/// Same as [`materialize`], reading straight from a live store.
pub fn materialize_store(store: &CellStore, min_rows: usize, min_cols: usize) -> GridFrame {
    materialize_cells(
        store
            .iter()
            .map(|(identity, value)| (identity.row, identity.col, value)),
        min_rows,
        min_cols,
    )
}

fn materialize_cells<'a, I>(cells: I, min_rows: usize, min_cols: usize) -> GridFrame
where
    I: Iterator<Item = (u32, u32, &'a str)> + Clone,
{
    let (max_row, max_col) = cells.clone().fold((None, None), |(r, c), (row, col, _)| {
        (
            Some(r.map_or(row, |r: u32| r.max(row))),
            Some(c.map_or(col, |c: u32| c.max(col))),
        )
    });
    let rows = min_rows.max(max_row.map_or(0, |r| r as usize + 1));
    let cols = min_cols.max(max_col.map_or(0, |c| c as usize + 1));

    let mut dense = vec![vec![String::new(); cols]; rows];
    for (row, col, value) in cells {
        dense[row as usize][col as usize] = value.to_string();
    }

    GridFrame {
        sequence: 0,
        rows,
        cols,
        cells: dense,
        column_labels: (0..cols).map(column_label).collect(),
    }
}
