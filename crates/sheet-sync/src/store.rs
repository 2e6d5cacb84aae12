//! Sparse in-memory cell storage for one sheet.
//!
//! The store is the single source of truth the renderer draws from. Two write
//! paths exist:
//!
//! - [`CellStore::set`] for local writes (optimistic edits, rollbacks,
//!   canonical values returned by a commit). Always applied.
//! - [`CellStore::merge`] for remote-origin writes. Applied unless the store
//!   already holds a revision at least as new as the incoming one.
//!
//! ```
//! # use sheet_sync::store::{CellStore, MergeOutcome};
//! # use sheet_sync::{CellIdentity, Revision, SheetId};
//! let sheet = SheetId::new("s");
//! let mut store = CellStore::new(sheet.clone());
//! let id = CellIdentity::new(sheet, 1, 1);
//! assert_eq!(store.merge(&id, "B", Some(Revision(5))), MergeOutcome::Applied);
//! assert_eq!(store.merge(&id, "A", Some(Revision(3))), MergeOutcome::Stale);
//! assert_eq!(store.get(&id), "B");
//! ```
//!
//! Every visible change marks the store dirty; the owner drains the flag once
//! per batch so a burst of writes costs a single materialization.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::identity::{CellIdentity, CellRecord, Revision, SheetId, SheetSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The held value changed.
    Applied,
    /// Same value already held; revision bookkeeping may have advanced.
    Unchanged,
    /// Incoming revision not newer than the held one; discarded.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCell {
    value: String,
    revision: Option<Revision>,
}

#[derive(Debug, Clone)]
pub struct CellStore {
    sheet: SheetId,
    cells: HashMap<CellIdentity, StoredCell>,
    dirty: bool,
    generation: u64,
}

impl CellStore {
    pub fn new(sheet: SheetId) -> Self {
        Self {
            sheet,
            cells: HashMap::new(),
            dirty: false,
            generation: 0,
        }
    }

    pub fn sheet(&self) -> &SheetId {
        &self.sheet
    }

    /// Current value; an identity never written reads as the empty string.
    pub fn get(&self, identity: &CellIdentity) -> &str {
        self.cells
            .get(identity)
            .map(|cell| cell.value.as_str())
            .unwrap_or("")
    }

    pub fn revision(&self, identity: &CellIdentity) -> Option<Revision> {
        self.cells.get(identity).and_then(|cell| cell.revision)
    }

    /// Local write. Keeps whatever revision is already held so later remote
    /// redeliveries are still judged against the last server-confirmed state.
    /// Returns whether the visible value changed. The first write creates the
    /// record even when the value is empty, exactly like [`Self::merge`].
    pub fn set(&mut self, identity: &CellIdentity, value: &str) -> bool {
        match self.cells.get_mut(identity) {
            Some(cell) if cell.value == value => false,
            None if value.is_empty() => {
                self.cells.insert(
                    identity.clone(),
                    StoredCell {
                        value: String::new(),
                        revision: None,
                    },
                );
                false
            }
            Some(cell) => {
                cell.value = value.to_string();
                self.touch();
                true
            }
            None => {
                self.cells.insert(
                    identity.clone(),
                    StoredCell {
                        value: value.to_string(),
                        revision: None,
                    },
                );
                self.touch();
                true
            }
        }
    }

    /// Remote-origin write following the revision ordering rule: no incoming
    /// revision means last-arrival-wins, otherwise the incoming revision must
    /// be strictly newer than the held one.
    pub fn merge(
        &mut self,
        identity: &CellIdentity,
        value: &str,
        revision: Option<Revision>,
    ) -> MergeOutcome {
        let held = self.revision(identity);
        if let (Some(incoming), Some(held)) = (revision, held) {
            if incoming <= held {
                debug!(
                    target = "sheet.store",
                    cell = %identity,
                    incoming = %incoming,
                    held = %held,
                    "discarding stale merge"
                );
                return MergeOutcome::Stale;
            }
        }
        let revision = revision.or(held);
        match self.cells.get_mut(identity) {
            Some(cell) if cell.value == value => {
                cell.revision = revision;
                MergeOutcome::Unchanged
            }
            Some(cell) => {
                cell.value = value.to_string();
                cell.revision = revision;
                self.touch();
                MergeOutcome::Applied
            }
            // First write of an empty value: the record exists from now on,
            // but nothing visible changed.
            None if value.is_empty() => {
                self.cells.insert(
                    identity.clone(),
                    StoredCell {
                        value: String::new(),
                        revision,
                    },
                );
                MergeOutcome::Unchanged
            }
            None => {
                self.cells.insert(
                    identity.clone(),
                    StoredCell {
                        value: value.to_string(),
                        revision,
                    },
                );
                self.touch();
                MergeOutcome::Applied
            }
        }
    }

    /// Advances the held revision without touching the value. Used when a
    /// remote event confirms what is already displayed.
    pub fn note_revision(&mut self, identity: &CellIdentity, revision: Revision) {
        if let Some(cell) = self.cells.get_mut(identity) {
            if cell.revision.map_or(true, |held| revision > held) {
                trace!(target = "sheet.store", cell = %identity, revision = %revision, "revision advanced");
                cell.revision = Some(revision);
            }
        }
    }

    /// Held cells in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&CellIdentity, &str)> + Clone + '_ {
        self.cells
            .iter()
            .map(|(identity, cell)| (identity, cell.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of visible changes since creation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns whether anything changed since the last call and clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn snapshot(&self) -> SheetSnapshot {
        SheetSnapshot::from_records(
            self.sheet.clone(),
            self.cells.iter().map(|(identity, cell)| CellRecord {
                identity: identity.clone(),
                value: cell.value.clone(),
                revision: cell.revision,
            }),
        )
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.generation = self.generation.wrapping_add(1);
    }
}
