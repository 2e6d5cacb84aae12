//! In-memory backing store implementing both remote services.
//!
//! Committed cells live in a per-sheet map with a global revision counter.
//! Every commit is broadcast as a JSON envelope on the `change-bus` topic
//! `sheet.<id>.changes`, which is what subscribers read. Knobs exist for the
//! failure modes a real deployment shows: rejected commits, server-side
//! normalization, latency (and therefore reordering), refused handshakes and
//! dropped transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use change_bus::{Bus, LocalBus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::{CellIdentity, CellRecord, Revision, SheetId, SheetSnapshot};
use crate::remote::{ChangeEvent, ChangeFeed, CommitAck, CommitService, FeedSignal, FeedStream};

pub type RejectFn = Arc<dyn Fn(&CellIdentity, &str) -> Option<String> + Send + Sync>;
pub type NormalizeFn = Arc<dyn Fn(&str) -> String + Send + Sync>;
pub type LatencyFn = Arc<dyn Fn(&CellIdentity, &str) -> Duration + Send + Sync>;

#[derive(Deserialize, Serialize)]
struct Envelope<T> {
    #[serde(rename = "type")]
    kind: String,
    payload: T,
}

pub fn changes_topic(sheet: &SheetId) -> String {
    format!("sheet.{sheet}.changes")
}

#[derive(Default)]
struct Policy {
    reject: Option<RejectFn>,
    normalize: Option<NormalizeFn>,
    latency: Option<LatencyFn>,
    refuse_subscriptions: Option<String>,
    without_revisions: bool,
}

#[derive(Default)]
struct Durable {
    next_revision: u64,
    sheets: HashMap<SheetId, HashMap<(u32, u32), CellRecord>>,
    commits: u64,
}

pub struct InMemorySheetBackend {
    bus: Arc<dyn Bus>,
    durable: parking_lot::Mutex<Durable>,
    policy: parking_lot::RwLock<Policy>,
}

impl InMemorySheetBackend {
    pub fn new() -> Arc<Self> {
        Self::with_bus(Arc::new(LocalBus::new()))
    }

    pub fn with_bus(bus: Arc<dyn Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            durable: parking_lot::Mutex::new(Durable::default()),
            policy: parking_lot::RwLock::new(Policy::default()),
        })
    }

    /// Rejects a commit whenever `reject` returns a reason.
    pub fn set_reject<F>(&self, reject: F)
    where
        F: Fn(&CellIdentity, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.policy.write().reject = Some(Arc::new(reject));
    }

    /// Server-side normalization; the result is the canonical value.
    pub fn set_normalizer<F>(&self, normalize: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.policy.write().normalize = Some(Arc::new(normalize));
    }

    pub fn set_latency<F>(&self, latency: F)
    where
        F: Fn(&CellIdentity, &str) -> Duration + Send + Sync + 'static,
    {
        self.policy.write().latency = Some(Arc::new(latency));
    }

    pub fn set_fixed_latency(&self, latency: Duration) {
        self.set_latency(move |_, _| latency);
    }

    /// Makes the next handshakes fail with `reason`; `None` accepts again.
    pub fn refuse_subscriptions(&self, reason: Option<String>) {
        self.policy.write().refuse_subscriptions = reason;
    }

    /// Stops attaching revision tokens, leaving clients with pure
    /// last-arrival-wins ordering.
    pub fn disable_revisions(&self) {
        self.policy.write().without_revisions = true;
    }

    pub fn clear_faults(&self) {
        let mut policy = self.policy.write();
        policy.reject = None;
        policy.latency = None;
        policy.refuse_subscriptions = None;
    }

    /// Drops the transport under every live subscription of `sheet`.
    pub fn fail_feed(&self, sheet: &SheetId) -> bool {
        self.bus.close(&changes_topic(sheet))
    }

    pub fn subscriber_count(&self, sheet: &SheetId) -> usize {
        self.bus.subscriber_count(&changes_topic(sheet))
    }

    pub fn commit_count(&self) -> u64 {
        self.durable.lock().commits
    }

    /// Writes a cell as another client would, publishing the change.
    pub fn write_external(&self, identity: &CellIdentity, value: &str) -> CommitAck {
        self.store_and_publish(identity, value.to_string())
    }

    /// Publishes an arbitrary event without touching durable state. Useful to
    /// replay stale or duplicate deliveries.
    pub fn inject_event(&self, event: &ChangeEvent) -> SyncResult<usize> {
        self.publish(event)
    }

    pub fn durable_snapshot(&self, sheet: &SheetId) -> SheetSnapshot {
        let durable = self.durable.lock();
        let records = durable
            .sheets
            .get(sheet)
            .map(|cells| cells.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        SheetSnapshot::from_records(sheet.clone(), records)
    }

    fn store_and_publish(&self, identity: &CellIdentity, canonical: String) -> CommitAck {
        let without_revisions = self.policy.read().without_revisions;
        let event = {
            let mut durable = self.durable.lock();
            durable.commits += 1;
            durable.next_revision += 1;
            let revision = (!without_revisions).then_some(Revision(durable.next_revision));
            let record = CellRecord {
                identity: identity.clone(),
                value: canonical,
                revision,
            };
            durable
                .sheets
                .entry(identity.sheet.clone())
                .or_default()
                .insert((identity.row, identity.col), record.clone());
            // Publishing under the lock keeps feed order equal to commit order.
            let event = ChangeEvent {
                identity: record.identity,
                value: record.value,
                revision: record.revision,
            };
            if let Err(err) = self.publish(&event) {
                warn!(target = "sheet.backend", cell = %identity, error = %err, "failed to publish change");
            }
            event
        };
        CommitAck {
            canonical_value: event.value,
            revision: event.revision,
        }
    }

    fn publish(&self, event: &ChangeEvent) -> SyncResult<usize> {
        let envelope = serde_json::to_vec(&Envelope {
            kind: "change".into(),
            payload: event,
        })?;
        Ok(self
            .bus
            .publish(&changes_topic(&event.identity.sheet), Bytes::from(envelope)))
    }
}

fn decode_change(payload: &[u8]) -> Result<ChangeEvent, serde_json::Error> {
    serde_json::from_slice::<Envelope<ChangeEvent>>(payload).map(|env| env.payload)
}

#[async_trait]
impl CommitService for InMemorySheetBackend {
    async fn commit_cell(
        &self,
        sheet: &SheetId,
        row: u32,
        col: u32,
        value: &str,
    ) -> SyncResult<CommitAck> {
        let identity = CellIdentity::new(sheet.clone(), row, col);
        let (reject, normalize, latency) = {
            let policy = self.policy.read();
            (
                policy.reject.clone(),
                policy.normalize.clone(),
                policy.latency.clone(),
            )
        };

        if let Some(latency) = latency {
            let delay = latency(&identity, value);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        if let Some(reason) = reject.and_then(|reject| reject(&identity, value)) {
            debug!(target = "sheet.backend", cell = %identity, reason = %reason, "commit rejected");
            return Err(SyncError::CommitRejected { identity, reason });
        }

        let canonical = match normalize {
            Some(normalize) => normalize(value),
            None => value.to_string(),
        };
        Ok(self.store_and_publish(&identity, canonical))
    }

    async fn fetch_sheet(&self, sheet: &SheetId) -> SyncResult<SheetSnapshot> {
        Ok(self.durable_snapshot(sheet))
    }
}

#[async_trait]
impl ChangeFeed for InMemorySheetBackend {
    async fn subscribe(&self, sheet: &SheetId) -> SyncResult<FeedStream> {
        let refused = self.policy.read().refuse_subscriptions.clone();
        if let Some(reason) = refused {
            return Err(SyncError::Subscription(reason));
        }
        let rx = self.bus.subscribe(&changes_topic(sheet));
        debug!(target = "sheet.backend", sheet = %sheet, "change feed subscribed");

        let stream = futures::stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(msg) => match decode_change(&msg.payload) {
                        Ok(event) => return Some((FeedSignal::Change(event), Some(rx))),
                        Err(err) => {
                            warn!(target = "sheet.backend", topic = %msg.topic, error = %err, "dropping undecodable change");
                        }
                    },
                    Err(RecvError::Lagged(missed)) => {
                        return Some((
                            FeedSignal::Failed(format!("feed lagged; {missed} changes lost")),
                            None,
                        ));
                    }
                    Err(RecvError::Closed) => {
                        return Some((FeedSignal::Failed("feed transport closed".into()), None));
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
