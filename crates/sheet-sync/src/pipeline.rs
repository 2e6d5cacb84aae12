//! Optimistic mutation pipeline.
//!
//! Each user edit is applied to the [`CellStore`] before anything asynchronous
//! happens, then tracked as a [`PendingMutation`] until its commit resolves:
//!
//! ```text
//! Queued -> Inflight -> Confirmed
//!                    \-> Failed (rolled back)
//! ```
//!
//! Edits to one identity form a chain. A second edit while the first is still
//! open supersedes it: the chain keeps the value from before the *first* edit
//! as its rollback target, and the superseded request stays tracked until its
//! own response arrives. Any failure in a chain restores that target and
//! discards the whole chain. Commits are never retried here.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::identity::CellIdentity;
use crate::remote::CommitAck;
use crate::store::CellStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Queued,
    Inflight,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub id: MutationId,
    pub identity: CellIdentity,
    /// Value captured synchronously before the optimistic write.
    pub previous_value: String,
    pub new_value: String,
    pub status: MutationStatus,
}

/// What the caller must send to the commit service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub id: MutationId,
    pub identity: CellIdentity,
    pub value: String,
}

#[derive(Debug)]
pub enum Resolution {
    /// Head mutation confirmed. `canonical` is set when the server normalized
    /// the value and the store was updated to it.
    Confirmed {
        id: MutationId,
        identity: CellIdentity,
        canonical: Option<String>,
    },
    /// A superseded request succeeded; the chain's head is still open.
    SupersededConfirmed { id: MutationId, identity: CellIdentity },
    /// The cell was restored to the chain's rollback target.
    RolledBack {
        id: MutationId,
        identity: CellIdentity,
        restored: String,
        error: SyncError,
    },
    /// Response for a mutation no longer tracked (already confirmed by echo,
    /// discarded with its chain, or never issued).
    Discarded { id: MutationId },
}

/// Result of checking an incoming remote change against open chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoMatch {
    /// The change is the server's copy of the open head edit.
    Head { id: MutationId },
    None,
}

#[derive(Debug)]
struct Chain {
    origin: String,
    head: Option<PendingMutation>,
    superseded: BTreeMap<MutationId, String>,
    /// Remote state overwrote the optimistic value after the head was issued.
    rebased: bool,
}

impl Chain {
    fn is_settled(&self) -> bool {
        self.head.is_none() && self.superseded.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MutationPipeline {
    next_id: u64,
    chains: HashMap<CellIdentity, Chain>,
    index: HashMap<MutationId, CellIdentity>,
}

impl MutationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `new_value` optimistically and opens (or extends) the chain for
    /// `identity`. The returned mutation is `Queued` until [`Self::mark_inflight`].
    pub fn submit(
        &mut self,
        store: &mut CellStore,
        identity: CellIdentity,
        new_value: String,
    ) -> CommitRequest {
        let previous_value = store.get(&identity).to_string();
        self.next_id += 1;
        let id = MutationId(self.next_id);

        let chain = self.chains.entry(identity.clone()).or_insert_with(|| Chain {
            origin: previous_value.clone(),
            head: None,
            superseded: BTreeMap::new(),
            rebased: false,
        });
        if let Some(prior) = chain.head.take() {
            debug!(
                target = "sheet.pipeline",
                cell = %identity,
                superseded = %prior.id,
                by = %id,
                "edit supersedes open mutation"
            );
            chain.superseded.insert(prior.id, prior.new_value);
        }
        chain.rebased = false;
        chain.head = Some(PendingMutation {
            id,
            identity: identity.clone(),
            previous_value: chain.origin.clone(),
            new_value: new_value.clone(),
            status: MutationStatus::Queued,
        });
        self.index.insert(id, identity.clone());

        store.set(&identity, &new_value);

        CommitRequest {
            id,
            identity,
            value: new_value,
        }
    }

    /// Records that the commit call for `id` has been issued.
    pub fn mark_inflight(&mut self, id: MutationId) -> bool {
        match self.head_mut(id) {
            Some(head) if head.status == MutationStatus::Queued => {
                head.status = MutationStatus::Inflight;
                true
            }
            _ => false,
        }
    }

    pub fn resolve(
        &mut self,
        store: &mut CellStore,
        id: MutationId,
        result: Result<CommitAck, SyncError>,
    ) -> Resolution {
        let Some(identity) = self.index.remove(&id) else {
            debug!(target = "sheet.pipeline", mutation = %id, "discarding response for untracked mutation");
            return Resolution::Discarded { id };
        };
        let Some(chain) = self.chains.get_mut(&identity) else {
            return Resolution::Discarded { id };
        };

        let is_head = chain.head.as_ref().is_some_and(|head| head.id == id);
        match result {
            Err(error) => {
                let restored = chain.origin.clone();
                self.discard_chain(&identity);
                store.set(&identity, &restored);
                warn!(
                    target = "sheet.pipeline",
                    cell = %identity,
                    mutation = %id,
                    error = %error,
                    restored = %restored,
                    "commit failed; rolled back"
                );
                Resolution::RolledBack {
                    id,
                    identity,
                    restored,
                    error,
                }
            }
            Ok(ack) if is_head => {
                let rebased = chain.rebased;
                let mut canonical = None;
                if let Some(mut head) = chain.head.take() {
                    head.status = MutationStatus::Confirmed;
                    if !rebased {
                        if ack.canonical_value != head.new_value {
                            store.set(&identity, &ack.canonical_value);
                            canonical = Some(ack.canonical_value.clone());
                        }
                        if let Some(revision) = ack.revision {
                            store.note_revision(&identity, revision);
                        }
                    }
                }
                if chain.is_settled() {
                    self.chains.remove(&identity);
                }
                debug!(
                    target = "sheet.pipeline",
                    cell = %identity,
                    mutation = %id,
                    rebased,
                    canonicalized = canonical.is_some(),
                    "commit confirmed"
                );
                Resolution::Confirmed {
                    id,
                    identity,
                    canonical,
                }
            }
            Ok(_) => {
                chain.superseded.remove(&id);
                if chain.is_settled() {
                    self.chains.remove(&identity);
                }
                Resolution::SupersededConfirmed { id, identity }
            }
        }
    }

    /// Checks whether a remote change is the echo of the open head edit and,
    /// if so, confirms it. The head only matches while `Inflight`. A value
    /// equal to a superseded request is not an echo: the server may have
    /// applied it after the head, so it has to go through a normal merge.
    /// Revision bookkeeping is left to the caller.
    pub fn confirm_echo(&mut self, identity: &CellIdentity, value: &str) -> EchoMatch {
        let Some(chain) = self.chains.get_mut(identity) else {
            return EchoMatch::None;
        };
        let Some(id) = chain
            .head
            .as_ref()
            .filter(|head| head.status == MutationStatus::Inflight && head.new_value == value)
            .map(|head| head.id)
        else {
            return EchoMatch::None;
        };

        chain.head = None;
        if chain.is_settled() {
            self.chains.remove(identity);
        }
        self.index.remove(&id);
        EchoMatch::Head { id }
    }

    /// A remote value replaced the optimistic one: it becomes the rollback
    /// target, and the head's eventual response must not write over it.
    pub fn rebase(&mut self, identity: &CellIdentity, value: &str) {
        if let Some(chain) = self.chains.get_mut(identity) {
            chain.origin = value.to_string();
            chain.rebased = true;
            if let Some(head) = chain.head.as_mut() {
                head.previous_value = value.to_string();
            }
        }
    }

    /// Moves the rollback target without implying the displayed value changed.
    /// Used when a fresh snapshot arrives for a cell with open edits.
    pub fn retarget(&mut self, identity: &CellIdentity, value: &str) -> bool {
        match self.chains.get_mut(identity) {
            Some(chain) => {
                chain.origin = value.to_string();
                if let Some(head) = chain.head.as_mut() {
                    head.previous_value = value.to_string();
                }
                true
            }
            None => false,
        }
    }

    pub fn has_open(&self, identity: &CellIdentity) -> bool {
        self.chains.contains_key(identity)
    }

    pub fn head(&self, identity: &CellIdentity) -> Option<&PendingMutation> {
        self.chains.get(identity).and_then(|chain| chain.head.as_ref())
    }

    /// Open head mutations, ordered by id.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut out: Vec<PendingMutation> = self
            .chains
            .values()
            .filter_map(|chain| chain.head.clone())
            .collect();
        out.sort_by_key(|pending| pending.id);
        out
    }

    /// Requests still awaiting a response, superseded ones included.
    pub fn outstanding(&self) -> usize {
        self.index.len()
    }

    fn head_mut(&mut self, id: MutationId) -> Option<&mut PendingMutation> {
        let identity = self.index.get(&id)?;
        self.chains
            .get_mut(identity)?
            .head
            .as_mut()
            .filter(|head| head.id == id)
    }

    fn discard_chain(&mut self, identity: &CellIdentity) {
        if let Some(chain) = self.chains.remove(identity) {
            if let Some(head) = chain.head {
                self.index.remove(&head.id);
            }
            for id in chain.superseded.keys() {
                self.index.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Revision, SheetId};

    fn id(row: u32, col: u32) -> CellIdentity {
        CellIdentity::new(SheetId::new("s"), row, col)
    }

    fn ack(value: &str, revision: Option<u64>) -> Result<CommitAck, SyncError> {
        Ok(CommitAck {
            canonical_value: value.into(),
            revision: revision.map(Revision),
        })
    }

    fn rejected(identity: &CellIdentity) -> Result<CommitAck, SyncError> {
        Err(SyncError::CommitRejected {
            identity: identity.clone(),
            reason: "nope".into(),
        })
    }

    fn submit(
        pipeline: &mut MutationPipeline,
        store: &mut CellStore,
        identity: &CellIdentity,
        value: &str,
    ) -> MutationId {
        let request = pipeline.submit(store, identity.clone(), value.into());
        assert!(pipeline.mark_inflight(request.id));
        request.id
    }

    #[test]
    fn submit_applies_optimistically() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let request = pipeline.submit(&mut store, id(0, 0), "hi".into());
        assert_eq!(store.get(&id(0, 0)), "hi");
        let head = pipeline.head(&id(0, 0)).unwrap();
        assert_eq!(head.status, MutationStatus::Queued);
        assert_eq!(head.previous_value, "");
        assert!(pipeline.mark_inflight(request.id));
        assert!(!pipeline.mark_inflight(request.id));
        assert_eq!(pipeline.head(&id(0, 0)).unwrap().status, MutationStatus::Inflight);
    }

    #[test]
    fn confirm_without_normalization_leaves_store() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let m = submit(&mut pipeline, &mut store, &id(0, 0), "hi");
        store.take_dirty();
        let resolution = pipeline.resolve(&mut store, m, ack("hi", Some(3)));
        assert!(matches!(resolution, Resolution::Confirmed { canonical: None, .. }));
        assert!(!store.is_dirty());
        assert_eq!(store.revision(&id(0, 0)), Some(Revision(3)));
        assert!(!pipeline.has_open(&id(0, 0)));
        assert_eq!(pipeline.outstanding(), 0);
    }

    #[test]
    fn canonical_value_replaces_optimistic() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let m = submit(&mut pipeline, &mut store, &id(0, 0), " 42 ");
        let resolution = pipeline.resolve(&mut store, m, ack("42", None));
        assert!(matches!(
            resolution,
            Resolution::Confirmed { canonical: Some(ref v), .. } if v == "42"
        ));
        assert_eq!(store.get(&id(0, 0)), "42");
    }

    #[test]
    fn failure_rolls_back() {
        let mut store = CellStore::new("s".into());
        store.set(&id(1, 1), "before");
        let mut pipeline = MutationPipeline::new();
        let m = submit(&mut pipeline, &mut store, &id(1, 1), "after");
        let resolution = pipeline.resolve(&mut store, m, rejected(&id(1, 1)));
        match resolution {
            Resolution::RolledBack { restored, error, .. } => {
                assert_eq!(restored, "before");
                assert_eq!(error.kind(), "rejected");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.get(&id(1, 1)), "before");
        assert!(!pipeline.has_open(&id(1, 1)));
    }

    #[test]
    fn superseding_edit_keeps_original_previous_value() {
        let mut store = CellStore::new("s".into());
        store.set(&id(0, 0), "A");
        let mut pipeline = MutationPipeline::new();
        let first = submit(&mut pipeline, &mut store, &id(0, 0), "B");
        let second = submit(&mut pipeline, &mut store, &id(0, 0), "C");
        assert_eq!(pipeline.pending().len(), 1);
        let head = pipeline.head(&id(0, 0)).unwrap();
        assert_eq!(head.id, second);
        assert_eq!(head.previous_value, "A");
        assert_eq!(pipeline.outstanding(), 2);

        // Later edit succeeds, then the first one fails: back to "A".
        assert!(matches!(
            pipeline.resolve(&mut store, second, ack("C", None)),
            Resolution::Confirmed { .. }
        ));
        assert_eq!(store.get(&id(0, 0)), "C");
        assert!(matches!(
            pipeline.resolve(&mut store, first, rejected(&id(0, 0))),
            Resolution::RolledBack { ref restored, .. } if restored == "A"
        ));
        assert_eq!(store.get(&id(0, 0)), "A");
        assert_eq!(pipeline.outstanding(), 0);
    }

    #[test]
    fn superseded_failure_discards_head_response() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let first = submit(&mut pipeline, &mut store, &id(0, 0), "B");
        let second = submit(&mut pipeline, &mut store, &id(0, 0), "C");
        pipeline.resolve(&mut store, first, rejected(&id(0, 0)));
        assert_eq!(store.get(&id(0, 0)), "");
        assert!(matches!(
            pipeline.resolve(&mut store, second, ack("C", None)),
            Resolution::Discarded { .. }
        ));
        assert_eq!(store.get(&id(0, 0)), "");
    }

    #[test]
    fn superseded_success_keeps_head_open() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let first = submit(&mut pipeline, &mut store, &id(0, 0), "B");
        let second = submit(&mut pipeline, &mut store, &id(0, 0), "C");
        assert!(matches!(
            pipeline.resolve(&mut store, first, ack("B", None)),
            Resolution::SupersededConfirmed { .. }
        ));
        assert_eq!(store.get(&id(0, 0)), "C");
        assert_eq!(pipeline.head(&id(0, 0)).map(|h| h.id), Some(second));
    }

    #[test]
    fn echo_confirms_inflight_head_only() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let request = pipeline.submit(&mut store, id(2, 3), "X".into());
        // Still queued: not an echo yet.
        assert_eq!(pipeline.confirm_echo(&id(2, 3), "X"), EchoMatch::None);
        pipeline.mark_inflight(request.id);
        store.take_dirty();
        assert_eq!(
            pipeline.confirm_echo(&id(2, 3), "X"),
            EchoMatch::Head { id: request.id }
        );
        assert!(!store.is_dirty());
        assert!(matches!(
            pipeline.resolve(&mut store, request.id, ack("X", None)),
            Resolution::Discarded { .. }
        ));
    }

    #[test]
    fn superseded_value_is_not_an_echo() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        submit(&mut pipeline, &mut store, &id(0, 0), "B");
        let second = submit(&mut pipeline, &mut store, &id(0, 0), "C");
        assert_eq!(pipeline.confirm_echo(&id(0, 0), "B"), EchoMatch::None);
        assert_eq!(pipeline.head(&id(0, 0)).map(|h| h.id), Some(second));
        assert_eq!(pipeline.outstanding(), 2);
    }

    #[test]
    fn rebased_chain_never_resurrects_local_value() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let m = submit(&mut pipeline, &mut store, &id(0, 0), "10");
        store.merge(&id(0, 0), "99", Some(Revision(7)));
        pipeline.rebase(&id(0, 0), "99");

        pipeline.resolve(&mut store, m, ack("10", Some(8)));
        assert_eq!(store.get(&id(0, 0)), "99");

        let m = submit(&mut pipeline, &mut store, &id(0, 0), "11");
        store.merge(&id(0, 0), "98", Some(Revision(9)));
        pipeline.rebase(&id(0, 0), "98");
        pipeline.resolve(&mut store, m, rejected(&id(0, 0)));
        assert_eq!(store.get(&id(0, 0)), "98");
    }

    #[test]
    fn retarget_moves_rollback_target_only() {
        let mut store = CellStore::new("s".into());
        let mut pipeline = MutationPipeline::new();
        let m = submit(&mut pipeline, &mut store, &id(0, 0), "mine");
        assert!(pipeline.retarget(&id(0, 0), "server"));
        assert!(!pipeline.retarget(&id(5, 5), "server"));
        assert_eq!(store.get(&id(0, 0)), "mine");
        pipeline.resolve(&mut store, m, rejected(&id(0, 0)));
        assert_eq!(store.get(&id(0, 0)), "server");
    }
}
