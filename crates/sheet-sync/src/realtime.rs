//! Realtime merge engine: owns the single change-feed subscription of a sheet
//! and folds committed changes into the store.
//!
//! Conflict policy is last-write-wins. A change that is merely the server's
//! copy of one of our own in-flight edits is absorbed as a confirmation
//! instead of being written again, so the user never sees their value blink.
//! Redelivered events are harmless because a merge is a keyed overwrite.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::identity::SheetId;
use crate::metrics;
use crate::pipeline::{EchoMatch, MutationId, MutationPipeline};
use crate::remote::{ChangeEvent, FeedSignal, FeedStream};
use crate::store::{CellStore, MergeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDisposition {
    /// Confirmed one of our own edits; store value untouched.
    Echo(MutationId),
    Applied,
    Unchanged,
    /// Revision not newer than the held one. Not an error.
    Stale,
    /// Event addressed to a different sheet.
    Ignored,
}

impl MergeDisposition {
    fn label(self) -> &'static str {
        match self {
            MergeDisposition::Echo(_) => "echo",
            MergeDisposition::Applied => "applied",
            MergeDisposition::Unchanged => "unchanged",
            MergeDisposition::Stale => "stale",
            MergeDisposition::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: u64,
    pub unchanged: u64,
    pub stale: u64,
    pub echoes: u64,
    pub ignored: u64,
}

struct ActiveFeed {
    epoch: u64,
    pump: JoinHandle<()>,
}

pub struct RealtimeMergeEngine {
    sheet: SheetId,
    active: Option<ActiveFeed>,
    stats: MergeStats,
}

impl RealtimeMergeEngine {
    pub fn new(sheet: SheetId) -> Self {
        Self {
            sheet,
            active: None,
            stats: MergeStats::default(),
        }
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn active_epoch(&self) -> Option<u64> {
        self.active.as_ref().map(|feed| feed.epoch)
    }

    /// Applies one committed change.
    pub fn apply(
        &mut self,
        store: &mut CellStore,
        pipeline: &mut MutationPipeline,
        event: &ChangeEvent,
    ) -> MergeDisposition {
        let disposition = self.merge(store, pipeline, event);
        match disposition {
            MergeDisposition::Echo(_) => self.stats.echoes += 1,
            MergeDisposition::Applied => self.stats.applied += 1,
            MergeDisposition::Unchanged => self.stats.unchanged += 1,
            MergeDisposition::Stale => self.stats.stale += 1,
            MergeDisposition::Ignored => self.stats.ignored += 1,
        }
        metrics::MERGES
            .with_label_values(&[disposition.label()])
            .inc();
        disposition
    }

    fn merge(
        &self,
        store: &mut CellStore,
        pipeline: &mut MutationPipeline,
        event: &ChangeEvent,
    ) -> MergeDisposition {
        let identity = &event.identity;
        if identity.sheet != self.sheet {
            debug!(
                target = "sheet.realtime",
                sheet = %self.sheet,
                cell = %identity,
                "ignoring change for another sheet"
            );
            return MergeDisposition::Ignored;
        }

        match pipeline.confirm_echo(identity, &event.value) {
            EchoMatch::Head { id } if store.get(identity) == event.value => {
                debug!(target = "sheet.realtime", cell = %identity, mutation = %id, "self-echo confirmed edit");
                if let Some(revision) = event.revision {
                    store.note_revision(identity, revision);
                }
                return MergeDisposition::Echo(id);
            }
            // Our head was confirmed but a remote value has since replaced it
            // locally; fall through and merge so the store follows the server.
            EchoMatch::Head { .. } | EchoMatch::None => {}
        }

        let outcome = store.merge(identity, &event.value, event.revision);
        match outcome {
            MergeOutcome::Applied | MergeOutcome::Unchanged => {
                if pipeline.has_open(identity) {
                    trace!(target = "sheet.realtime", cell = %identity, "remote value overtook open edit");
                    pipeline.rebase(identity, &event.value);
                }
                if outcome == MergeOutcome::Applied {
                    MergeDisposition::Applied
                } else {
                    MergeDisposition::Unchanged
                }
            }
            MergeOutcome::Stale => MergeDisposition::Stale,
        }
    }

    /// Starts forwarding `stream` into `sink`, tagging every signal with
    /// `epoch`. Replaces (and stops) any previous subscription so at most one
    /// is ever live. The pump reports a failure if the stream simply ends.
    pub fn attach<T, F>(&mut self, epoch: u64, mut stream: FeedStream, sink: mpsc::Sender<T>, wrap: F)
    where
        T: Send + 'static,
        F: Fn(u64, FeedSignal) -> T + Send + 'static,
    {
        self.detach();
        let pump = tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let failed = matches!(signal, FeedSignal::Failed(_));
                if sink.send(wrap(epoch, signal)).await.is_err() {
                    return;
                }
                if failed {
                    return;
                }
            }
            let _ = sink
                .send(wrap(epoch, FeedSignal::Failed("change feed ended".into())))
                .await;
        });
        self.active = Some(ActiveFeed { epoch, pump });
    }

    /// Drops the live subscription, if any.
    pub fn detach(&mut self) -> bool {
        match self.active.take() {
            Some(feed) => {
                feed.pump.abort();
                debug!(target = "sheet.realtime", sheet = %self.sheet, epoch = feed.epoch, "change feed detached");
                true
            }
            None => false,
        }
    }
}

impl Drop for RealtimeMergeEngine {
    fn drop(&mut self) {
        self.detach();
    }
}
