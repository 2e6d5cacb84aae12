//! Boundary with the remote side: the commit service that durably stores
//! cells, and the change feed that broadcasts committed changes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::identity::{CellIdentity, Revision, SheetId, SheetSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAck {
    pub canonical_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

/// One committed change as broadcast on the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub identity: CellIdentity,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    Change(ChangeEvent),
    /// Transport-level failure. The stream yields nothing after this.
    Failed(String),
}

/// Live subscription. Dropping it unsubscribes; the stream ending without a
/// `Failed` signal is also treated as a transport failure.
pub type FeedStream = BoxStream<'static, FeedSignal>;

#[async_trait]
pub trait CommitService: Send + Sync {
    /// Safe to call concurrently for different cells.
    async fn commit_cell(
        &self,
        sheet: &SheetId,
        row: u32,
        col: u32,
        value: &str,
    ) -> SyncResult<CommitAck>;

    async fn fetch_sheet(&self, sheet: &SheetId) -> SyncResult<SheetSnapshot>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Completes once the subscription handshake has succeeded.
    async fn subscribe(&self, sheet: &SheetId) -> SyncResult<FeedStream>;
}
