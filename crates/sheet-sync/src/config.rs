use std::time::Duration;

/// Tunables for one sheet session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Upper bound on a single commit call; expiry counts as a failed commit.
    pub commit_timeout: Duration,
    pub min_rows: usize,
    pub min_cols: usize,
    /// Largest addressable grid. Edits outside it are refused and remote
    /// changes outside it are dropped, so one bad coordinate cannot size the
    /// dense frame.
    pub max_rows: u32,
    pub max_cols: u32,
    pub command_buffer: usize,
    pub notice_buffer: usize,
    /// Messages drained per tick before a frame is produced.
    pub max_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_millis(10_000),
            min_rows: 100,
            min_cols: 26,
            max_rows: 10_000,
            max_cols: 702,
            command_buffer: 256,
            notice_buffer: 64,
            max_batch: 64,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let commit_timeout = env_parse("SHEET_COMMIT_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.commit_timeout);
        Self {
            commit_timeout,
            min_rows: env_parse("SHEET_MIN_ROWS").unwrap_or(defaults.min_rows),
            min_cols: env_parse("SHEET_MIN_COLS").unwrap_or(defaults.min_cols),
            max_rows: env_parse("SHEET_MAX_ROWS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_rows),
            max_cols: env_parse("SHEET_MAX_COLS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_cols),
            command_buffer: env_parse("SHEET_COMMAND_BUFFER")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.command_buffer),
            notice_buffer: env_parse("SHEET_NOTICE_BUFFER")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.notice_buffer),
            max_batch: env_parse("SHEET_MAX_BATCH")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_batch),
        }
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_minimums(mut self, rows: usize, cols: usize) -> Self {
        self.min_rows = rows;
        self.min_cols = cols;
        self
    }

    pub fn with_limits(mut self, max_rows: u32, max_cols: u32) -> Self {
        self.max_rows = max_rows;
        self.max_cols = max_cols;
        self
    }

    pub fn contains(&self, row: u32, col: u32) -> bool {
        row < self.max_rows && col < self.max_cols
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
