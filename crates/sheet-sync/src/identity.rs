use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::materialize::column_label;

/// Opaque identifier of one sheet. Never interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetId(String);

impl SheetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SheetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// `(sheet, row, col)`: the only key a cell is ever looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellIdentity {
    pub sheet: SheetId,
    pub row: u32,
    pub col: u32,
}

impl CellIdentity {
    pub fn new(sheet: SheetId, row: u32, col: u32) -> Self {
        Self { sheet, row, col }
    }

    /// Spreadsheet-style address for display, e.g. `B3` for row 2, column 1.
    pub fn a1(&self) -> String {
        format!("{}{}", column_label(self.col as usize), self.row as u64 + 1)
    }
}

impl fmt::Display for CellIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.a1())
    }
}

/// Server-assigned ordering token. Larger is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub identity: CellIdentity,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

/// Full content of one sheet. Records are unique by identity; order carries no
/// meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSnapshot {
    pub sheet: SheetId,
    pub records: Vec<CellRecord>,
}

impl SheetSnapshot {
    pub fn empty(sheet: SheetId) -> Self {
        Self {
            sheet,
            records: Vec::new(),
        }
    }

    /// Builds a snapshot keeping the last record seen for each identity.
    /// Records belonging to another sheet are dropped.
    pub fn from_records(sheet: SheetId, records: impl IntoIterator<Item = CellRecord>) -> Self {
        let mut by_identity: HashMap<CellIdentity, CellRecord> = HashMap::new();
        for record in records {
            if record.identity.sheet != sheet {
                continue;
            }
            by_identity.insert(record.identity.clone(), record);
        }
        let mut records: Vec<CellRecord> = by_identity.into_values().collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Self { sheet, records }
    }

    pub fn get(&self, row: u32, col: u32) -> Option<&CellRecord> {
        self.records
            .iter()
            .find(|record| record.identity.row == row && record.identity.col == col)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
