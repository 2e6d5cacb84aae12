//! One actor task per sheet.
//!
//! The task exclusively owns the [`CellStore`], the [`MutationPipeline`] and
//! the [`RealtimeMergeEngine`], so nothing that touches cell state ever runs
//! concurrently. User commands arrive from [`SheetHandle`]s; commit responses,
//! feed signals and handshake results arrive on an internal channel from the
//! tasks the actor spawns. After each message the actor drains whatever else
//! is ready (bounded by `max_batch`) and then materializes at most one frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionLifecycle, ConnectionState, ConnectionStatus};
use crate::error::{SyncError, SyncResult};
use crate::identity::{CellIdentity, SheetId, SheetSnapshot};
use crate::materialize::{materialize_store, GridFrame};
use crate::metrics;
use crate::pipeline::{MutationId, MutationPipeline, PendingMutation, Resolution};
use crate::realtime::RealtimeMergeEngine;
use crate::remote::{ChangeFeed, CommitAck, CommitService, FeedSignal, FeedStream};
use crate::store::{CellStore, MergeOutcome};

/// User-visible problems, published to every [`SheetHandle::notices`]
/// receiver.
#[derive(Debug, Clone)]
pub enum SyncNotice {
    /// A commit failed and the cell was restored to `restored`.
    CommitFailed {
        mutation: MutationId,
        identity: CellIdentity,
        restored: String,
        error: Arc<SyncError>,
    },
    ConnectionLost { epoch: u64, reason: String },
    /// A commit response arrived for a mutation that was no longer tracked.
    ResponseDiscarded { mutation: MutationId },
}

enum Command {
    Edit {
        row: u32,
        col: u32,
        value: String,
        reply: oneshot::Sender<SyncResult<MutationId>>,
    },
    Subscribe {
        reply: oneshot::Sender<u64>,
    },
    Unsubscribe {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SheetSnapshot>,
    },
    Pending {
        reply: oneshot::Sender<Vec<PendingMutation>>,
    },
    Teardown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    Committed {
        id: MutationId,
        result: SyncResult<CommitAck>,
    },
    Feed {
        epoch: u64,
        signal: FeedSignal,
    },
    Handshake {
        epoch: u64,
        result: SyncResult<(FeedStream, SheetSnapshot)>,
    },
}

enum Message {
    Command(Command),
    Internal(Internal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Cloneable front door to a running sheet session.
#[derive(Clone)]
pub struct SheetHandle {
    sheet: SheetId,
    commands: mpsc::Sender<Command>,
    frames: watch::Receiver<Arc<GridFrame>>,
    connection: watch::Receiver<ConnectionStatus>,
    notices: broadcast::Sender<SyncNotice>,
    closed: Arc<AtomicBool>,
}

impl SheetHandle {
    pub fn sheet(&self) -> &SheetId {
        &self.sheet
    }

    /// Applies the edit locally and starts its commit. Resolves once the
    /// optimistic value is in the store. Cells outside the configured grid
    /// limits are refused with [`SyncError::OutOfBounds`].
    pub async fn submit_edit(
        &self,
        row: u32,
        col: u32,
        value: impl Into<String>,
    ) -> SyncResult<MutationId> {
        let value = value.into();
        self.request(|reply| Command::Edit {
            row,
            col,
            value,
            reply,
        })
        .await?
    }

    /// Starts a new subscription epoch and returns it. The handshake and the
    /// snapshot re-fetch complete asynchronously; watch [`Self::connection`].
    pub async fn subscribe(&self) -> SyncResult<u64> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    pub async fn unsubscribe(&self) -> SyncResult<()> {
        self.request(|reply| Command::Unsubscribe { reply }).await
    }

    pub fn frames(&self) -> SyncResult<watch::Receiver<Arc<GridFrame>>> {
        self.ensure_open()?;
        Ok(self.frames.clone())
    }

    pub fn connection(&self) -> SyncResult<watch::Receiver<ConnectionStatus>> {
        self.ensure_open()?;
        Ok(self.connection.clone())
    }

    pub fn notices(&self) -> SyncResult<broadcast::Receiver<SyncNotice>> {
        self.ensure_open()?;
        Ok(self.notices.subscribe())
    }

    pub async fn snapshot(&self) -> SyncResult<SheetSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn pending(&self) -> SyncResult<Vec<PendingMutation>> {
        self.request(|reply| Command::Pending { reply }).await
    }

    /// Waits until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> SyncResult<ConnectionStatus> {
        let mut rx = self.connection()?;
        loop {
            {
                let status = rx.borrow_and_update();
                if status.state == state {
                    return Ok(status.clone());
                }
            }
            rx.changed().await.map_err(|_| SyncError::SessionClosed)?;
        }
    }

    /// Detaches the feed, closes the connection and stops the actor. Commit
    /// responses still in flight are dropped on arrival.
    pub async fn teardown(&self) -> SyncResult<()> {
        self.request(|reply| Command::Teardown { reply }).await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.commands.is_closed()
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_closed() {
            Err(SyncError::SessionClosed)
        } else {
            Ok(())
        }
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> SyncResult<R> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }
}

pub struct SheetSession {
    sheet: SheetId,
    config: SyncConfig,
    commit: Arc<dyn CommitService>,
    feed: Arc<dyn ChangeFeed>,
    store: CellStore,
    pipeline: MutationPipeline,
    engine: RealtimeMergeEngine,
    lifecycle: ConnectionLifecycle,
    frames: watch::Sender<Arc<GridFrame>>,
    frame_seq: u64,
    notices: broadcast::Sender<SyncNotice>,
    internal_tx: mpsc::Sender<Internal>,
}

impl SheetSession {
    /// Spawns the actor on the current tokio runtime.
    pub fn spawn(
        sheet: SheetId,
        commit: Arc<dyn CommitService>,
        feed: Arc<dyn ChangeFeed>,
        config: SyncConfig,
    ) -> SheetHandle {
        let store = CellStore::new(sheet.clone());
        let initial = materialize_store(&store, config.min_rows, config.min_cols);
        let (frames_tx, frames_rx) = watch::channel(Arc::new(initial));
        let (notices_tx, _) = broadcast::channel(config.notice_buffer.max(1));
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::channel(config.command_buffer.max(1));
        let lifecycle = ConnectionLifecycle::new();
        let connection_rx = lifecycle.watch();

        let session = SheetSession {
            sheet: sheet.clone(),
            config,
            commit,
            feed,
            store,
            pipeline: MutationPipeline::new(),
            engine: RealtimeMergeEngine::new(sheet.clone()),
            lifecycle,
            frames: frames_tx,
            frame_seq: 0,
            notices: notices_tx.clone(),
            internal_tx,
        };
        tokio::spawn(session.run(command_rx, internal_rx));

        SheetHandle {
            sheet,
            commands: command_tx,
            frames: frames_rx,
            connection: connection_rx,
            notices: notices_tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        info!(target = "sheet.session", sheet = %self.sheet, "session started");
        loop {
            let first = tokio::select! {
                biased;
                Some(msg) = internal.recv() => Message::Internal(msg),
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Message::Command(cmd),
                    None => {
                        debug!(target = "sheet.session", sheet = %self.sheet, "all handles dropped");
                        self.shutdown();
                        break;
                    }
                },
            };

            let mut flow = self.handle(first);
            let mut drained = 0usize;
            while flow == Flow::Continue && drained < self.config.max_batch {
                let next = match internal.try_recv() {
                    Ok(msg) => Message::Internal(msg),
                    Err(_) => match commands.try_recv() {
                        Ok(cmd) => Message::Command(cmd),
                        Err(_) => break,
                    },
                };
                flow = self.handle(next);
                drained += 1;
            }

            if flow == Flow::Stop {
                break;
            }
            self.flush_frame();
        }
        info!(target = "sheet.session", sheet = %self.sheet, "session stopped");
    }

    fn handle(&mut self, message: Message) -> Flow {
        match message {
            Message::Command(command) => self.handle_command(command),
            Message::Internal(internal) => {
                self.handle_internal(internal);
                Flow::Continue
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Edit {
                row,
                col,
                value,
                reply,
            } => {
                let result = if self.config.contains(row, col) {
                    Ok(self.submit(row, col, value))
                } else {
                    self.out_of_bounds("edit", row, col);
                    Err(SyncError::OutOfBounds {
                        row,
                        col,
                        max_rows: self.config.max_rows,
                        max_cols: self.config.max_cols,
                    })
                };
                let _ = reply.send(result);
            }
            Command::Subscribe { reply } => {
                let epoch = self.begin_subscribe();
                let _ = reply.send(epoch);
            }
            Command::Unsubscribe { reply } => {
                self.engine.detach();
                if self.lifecycle.state() != ConnectionState::Closed {
                    let _ = self.lifecycle.apply(ConnectionEvent::Teardown);
                }
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.store.snapshot());
            }
            Command::Pending { reply } => {
                let _ = reply.send(self.pipeline.pending());
            }
            Command::Teardown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Committed { id, result } => self.on_committed(id, result),
            Internal::Feed { epoch, signal } => self.on_feed(epoch, signal),
            Internal::Handshake { epoch, result } => self.on_handshake(epoch, result),
        }
    }

    fn submit(&mut self, row: u32, col: u32, value: String) -> MutationId {
        let identity = CellIdentity::new(self.sheet.clone(), row, col);
        let request = self.pipeline.submit(&mut self.store, identity, value);
        self.pipeline.mark_inflight(request.id);
        trace!(
            target = "sheet.session",
            cell = %request.identity,
            mutation = %request.id,
            "issuing commit"
        );

        let commit = Arc::clone(&self.commit);
        let tx = self.internal_tx.clone();
        let timeout = self.config.commit_timeout;
        let id = request.id;
        tokio::spawn(async move {
            let identity = request.identity;
            let call = commit.commit_cell(&identity.sheet, identity.row, identity.col, &request.value);
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::CommitTimeout {
                    identity: identity.clone(),
                    timeout,
                }),
            };
            if tx.send(Internal::Committed { id, result }).await.is_err() {
                debug!(
                    target = "sheet.session",
                    cell = %identity,
                    mutation = %id,
                    "session gone; commit response dropped"
                );
                metrics::COMMITS.with_label_values(&["discarded"]).inc();
            }
        });
        id
    }

    fn on_committed(&mut self, id: MutationId, result: SyncResult<CommitAck>) {
        match self.pipeline.resolve(&mut self.store, id, result) {
            Resolution::Confirmed { canonical, .. } => {
                let label = if canonical.is_some() {
                    "canonicalized"
                } else {
                    "confirmed"
                };
                metrics::COMMITS.with_label_values(&[label]).inc();
            }
            Resolution::SupersededConfirmed { .. } => {
                metrics::COMMITS.with_label_values(&["confirmed"]).inc();
            }
            Resolution::RolledBack {
                id,
                identity,
                restored,
                error,
            } => {
                metrics::COMMITS.with_label_values(&[error.kind()]).inc();
                metrics::ROLLBACKS.inc();
                self.notify(SyncNotice::CommitFailed {
                    mutation: id,
                    identity,
                    restored,
                    error: Arc::new(error),
                });
            }
            Resolution::Discarded { id } => {
                metrics::COMMITS.with_label_values(&["discarded"]).inc();
                self.notify(SyncNotice::ResponseDiscarded { mutation: id });
            }
        }
    }

    fn begin_subscribe(&mut self) -> u64 {
        self.engine.detach();
        let _ = self.lifecycle.apply(ConnectionEvent::Subscribe);
        let epoch = self.lifecycle.epoch();

        let feed = Arc::clone(&self.feed);
        let commit = Arc::clone(&self.commit);
        let sheet = self.sheet.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            // Feed first, so nothing committed after the snapshot is missed.
            let result = match feed.subscribe(&sheet).await {
                Ok(stream) => match commit.fetch_sheet(&sheet).await {
                    Ok(snapshot) => Ok((stream, snapshot)),
                    Err(SyncError::Snapshot(reason)) => Err(SyncError::Snapshot(reason)),
                    Err(err) => Err(SyncError::Snapshot(err.to_string())),
                },
                Err(err) => Err(err),
            };
            let _ = tx.send(Internal::Handshake { epoch, result }).await;
        });
        debug!(target = "sheet.session", sheet = %self.sheet, epoch, "subscribing");
        epoch
    }

    fn on_handshake(&mut self, epoch: u64, result: SyncResult<(FeedStream, SheetSnapshot)>) {
        if epoch != self.lifecycle.epoch() || self.lifecycle.state() != ConnectionState::Subscribing {
            debug!(target = "sheet.session", sheet = %self.sheet, epoch, "dropping superseded handshake");
            return;
        }
        match result {
            Ok((stream, snapshot)) => {
                self.apply_snapshot(&snapshot);
                self.engine
                    .attach(epoch, stream, self.internal_tx.clone(), |epoch, signal| {
                        Internal::Feed { epoch, signal }
                    });
                let _ = self.lifecycle.apply(ConnectionEvent::HandshakeSucceeded);
                info!(
                    target = "sheet.session",
                    sheet = %self.sheet,
                    epoch,
                    cells = snapshot.len(),
                    "subscribed"
                );
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(target = "sheet.session", sheet = %self.sheet, epoch, error = %err, "subscription handshake failed");
                let _ = self
                    .lifecycle
                    .apply(ConnectionEvent::HandshakeFailed(reason.clone()));
                self.notify(SyncNotice::ConnectionLost { epoch, reason });
            }
        }
    }

    /// Folds a freshly fetched snapshot into the store. Cells with open edits
    /// keep their optimistic value; the snapshot only moves their rollback
    /// target.
    fn apply_snapshot(&mut self, snapshot: &SheetSnapshot) {
        let mut applied = 0usize;
        let mut retargeted = 0usize;
        let mut repaired = 0usize;
        for record in &snapshot.records {
            let identity = &record.identity;
            if !self.config.contains(identity.row, identity.col) {
                self.out_of_bounds("snapshot", identity.row, identity.col);
                continue;
            }
            if self.pipeline.retarget(identity, &record.value) {
                retargeted += 1;
                continue;
            }
            match self.store.merge(identity, &record.value, record.revision) {
                MergeOutcome::Applied => applied += 1,
                // Same revision, different value: a rollback restored a value
                // the server had already replaced. The snapshot wins.
                MergeOutcome::Stale
                    if self.store.revision(identity) == record.revision
                        && self.store.get(identity) != record.value =>
                {
                    self.store.set(identity, &record.value);
                    repaired += 1;
                }
                MergeOutcome::Stale | MergeOutcome::Unchanged => {}
            }
        }
        debug!(
            target = "sheet.session",
            sheet = %self.sheet,
            records = snapshot.len(),
            applied,
            retargeted,
            repaired,
            "snapshot merged"
        );
    }

    fn on_feed(&mut self, epoch: u64, signal: FeedSignal) {
        if self.engine.active_epoch() != Some(epoch) {
            trace!(target = "sheet.session", sheet = %self.sheet, epoch, "ignoring signal from old subscription");
            return;
        }
        match signal {
            FeedSignal::Change(event) => {
                let (row, col) = (event.identity.row, event.identity.col);
                if self.config.contains(row, col) {
                    self.engine.apply(&mut self.store, &mut self.pipeline, &event);
                } else {
                    self.out_of_bounds("feed", row, col);
                }
            }
            FeedSignal::Failed(reason) => {
                self.engine.detach();
                warn!(target = "sheet.session", sheet = %self.sheet, epoch, reason = %reason, "change feed lost");
                let _ = self
                    .lifecycle
                    .apply(ConnectionEvent::TransportFailed(reason.clone()));
                self.notify(SyncNotice::ConnectionLost { epoch, reason });
            }
        }
    }

    fn out_of_bounds(&self, source: &'static str, row: u32, col: u32) {
        warn!(
            target = "sheet.session",
            sheet = %self.sheet,
            source,
            row,
            col,
            max_rows = self.config.max_rows,
            max_cols = self.config.max_cols,
            "cell outside grid limits dropped"
        );
        metrics::OUT_OF_BOUNDS.with_label_values(&[source]).inc();
    }

    fn flush_frame(&mut self) {
        if !self.store.take_dirty() {
            return;
        }
        let mut frame = materialize_store(&self.store, self.config.min_rows, self.config.min_cols);
        self.frame_seq += 1;
        frame.sequence = self.frame_seq;
        metrics::MATERIALIZATIONS.inc();
        trace!(
            target = "sheet.session",
            sheet = %self.sheet,
            sequence = frame.sequence,
            generation = self.store.generation(),
            rows = frame.rows,
            cols = frame.cols,
            "frame materialized"
        );
        self.frames.send_replace(Arc::new(frame));
    }

    fn shutdown(&mut self) {
        self.engine.detach();
        if self.lifecycle.state() != ConnectionState::Closed {
            let _ = self.lifecycle.apply(ConnectionEvent::Teardown);
        }
        let abandoned = self.pipeline.outstanding();
        if abandoned > 0 {
            debug!(
                target = "sheet.session",
                sheet = %self.sheet,
                abandoned,
                "teardown with commits in flight"
            );
        }
    }

    fn notify(&self, notice: SyncNotice) {
        // No receivers is fine; nobody is listening for notices.
        let _ = self.notices.send(notice);
    }
}
