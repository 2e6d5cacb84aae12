//! Drives several sessions against one in-memory backend.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sheet_sync::{
    CellIdentity, ConnectionState, GridFrame, InMemorySheetBackend, SheetHandle, SheetId,
    SheetSession, SheetSnapshot, SyncConfig, SyncNotice,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::Cli;

const QUIESCE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub client: usize,
    pub row: u32,
    pub col: u32,
    pub local: Option<String>,
    pub durable: Option<String>,
}

#[derive(Debug)]
pub struct SimReport {
    pub frame: Arc<GridFrame>,
    pub durable: SheetSnapshot,
    pub commits: u64,
    pub failures: usize,
    pub divergences: Vec<Divergence>,
}

impl SimReport {
    pub fn converged(&self) -> bool {
        self.divergences.is_empty()
    }
}

fn fingerprint(seed: u64, identity: &CellIdentity, value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    identity.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Rejections and latency are pure functions of the edit, so a run is
/// reproducible for a given seed apart from scheduling.
fn install_faults(backend: &InMemorySheetBackend, cli: &Cli) {
    let seed = cli.seed;
    let rate = cli.reject_rate;
    if rate > 0.0 {
        backend.set_reject(move |identity, value| {
            let mut rng = StdRng::seed_from_u64(fingerprint(seed, identity, value));
            rng.gen_bool(rate)
                .then(|| format!("simulated rejection of {}", identity.a1()))
        });
    }
    let max = cli.latency_ms;
    if max > 0 {
        backend.set_latency(move |identity, value| {
            let mut rng = StdRng::seed_from_u64(fingerprint(seed.rotate_left(17), identity, value));
            Duration::from_millis(rng.gen_range(0..=max))
        });
    }
}

fn values(snapshot: &SheetSnapshot) -> BTreeMap<(u32, u32), String> {
    snapshot
        .records
        .iter()
        .filter(|record| !record.value.is_empty())
        .map(|record| ((record.identity.row, record.identity.col), record.value.clone()))
        .collect()
}

fn diff(client: usize, local: &SheetSnapshot, durable: &SheetSnapshot) -> Vec<Divergence> {
    let local = values(local);
    let durable = values(durable);
    let mut keys: Vec<&(u32, u32)> = local.keys().chain(durable.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .filter(|key| local.get(key) != durable.get(key))
        .map(|&(row, col)| Divergence {
            client,
            row,
            col,
            local: local.get(&(row, col)).cloned(),
            durable: durable.get(&(row, col)).cloned(),
        })
        .collect()
}

fn count_failures(handle: &SheetHandle, counter: Arc<AtomicUsize>) -> Result<JoinHandle<()>> {
    let mut notices = handle.notices()?;
    Ok(tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(SyncNotice::CommitFailed { .. }) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(target = "sheet.sim", missed, "notice receiver lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }))
}

async fn subscribe_all(handles: &[SheetHandle]) -> Result<()> {
    for handle in handles {
        handle.subscribe().await?;
    }
    for handle in handles {
        handle.wait_for_state(ConnectionState::Subscribed).await?;
    }
    Ok(())
}

async fn quiesce(handles: &[SheetHandle], latency: Duration) -> Result<()> {
    let wait = async {
        for handle in handles {
            while !handle.pending().await?.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        // Superseded requests are not listed as pending; give them time to land.
        tokio::time::sleep(latency * 2 + Duration::from_millis(50)).await;
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(QUIESCE_DEADLINE, wait)
        .await
        .map_err(|_| anyhow!("sessions did not settle within {QUIESCE_DEADLINE:?}"))?
}

pub async fn run(cli: &Cli) -> Result<SimReport> {
    let sheet = SheetId::new(cli.sheet.clone());
    let backend = InMemorySheetBackend::new();
    install_faults(&backend, cli);

    let config = SyncConfig::from_env().with_minimums(cli.rows as usize, cli.cols as usize);
    let config = {
        let (max_rows, max_cols) = (config.max_rows.max(cli.rows), config.max_cols.max(cli.cols));
        config.with_limits(max_rows, max_cols)
    };
    let handles: Vec<SheetHandle> = (0..cli.clients)
        .map(|_| SheetSession::spawn(sheet.clone(), backend.clone(), backend.clone(), config.clone()))
        .collect();
    subscribe_all(&handles).await.context("initial subscribe")?;

    let failures = Arc::new(AtomicUsize::new(0));
    let counters = handles
        .iter()
        .map(|handle| count_failures(handle, failures.clone()))
        .collect::<Result<Vec<_>>>()?;

    info!(target = "sheet.sim", clients = cli.clients, edits = cli.edits, seed = cli.seed, "issuing edits");
    let mut rng = StdRng::seed_from_u64(cli.seed);
    for n in 0..cli.edits {
        let client = rng.gen_range(0..handles.len());
        let row = rng.gen_range(0..cli.rows);
        let col = rng.gen_range(0..cli.cols);
        let id = handles[client]
            .submit_edit(row, col, format!("c{client}#{n}"))
            .await?;
        debug!(target = "sheet.sim", client, row, col, mutation = %id, "edit submitted");
        if rng.gen_bool(0.25) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    let latency = Duration::from_millis(cli.latency_ms);
    quiesce(&handles, latency).await?;

    // A resubscribe forces every client through a snapshot re-fetch.
    subscribe_all(&handles).await.context("resubscribe")?;

    let durable = backend.durable_snapshot(&sheet);
    let mut divergences = Vec::new();
    for (client, handle) in handles.iter().enumerate() {
        let local = handle.snapshot().await?;
        divergences.extend(diff(client, &local, &durable));
    }
    let frame = handles[0].frames()?.borrow().clone();

    for handle in &handles {
        handle.teardown().await?;
    }
    for counter in counters {
        counter.abort();
    }

    Ok(SimReport {
        frame,
        durable,
        commits: backend.commit_count(),
        failures: failures.load(Ordering::Relaxed),
        divergences,
    })
}

/// Renders the top-left `rows` x `cols` corner of a frame as a text table.
pub fn render(frame: &GridFrame, rows: usize, cols: usize, width: usize) -> String {
    let rows = rows.min(frame.rows);
    let cols = cols.min(frame.cols);
    let fit = |text: &str| -> String {
        let clipped: String = text.chars().take(width).collect();
        format!("{clipped:<width$}")
    };

    let mut out = String::new();
    out.push_str(&format!("{:>4} ", ""));
    for label in frame.column_labels.iter().take(cols) {
        out.push_str(&fit(label));
        out.push(' ');
    }
    out.push('\n');
    for (index, row) in frame.cells.iter().take(rows).enumerate() {
        out.push_str(&format!("{:>4} ", index + 1));
        for cell in row.iter().take(cols) {
            out.push_str(&fit(cell));
            out.push(' ');
        }
        out.push('\n');
    }
    out
}
