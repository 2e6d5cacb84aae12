//! Optimistic, realtime-synchronized spreadsheet grid core.
//!
//! A sheet is a sparse map of cells keyed by [`CellIdentity`]. Local edits are
//! written to the [`store::CellStore`] immediately and committed in the
//! background through a [`remote::CommitService`]; committed changes from
//! every client arrive on a [`remote::ChangeFeed`] and are merged
//! last-write-wins, honoring [`Revision`] tokens when the server supplies
//! them. The [`session`] module ties the pieces together into one actor per
//! sheet that publishes dense [`materialize::GridFrame`]s for rendering.

pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod identity;
pub mod materialize;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod realtime;
pub mod remote;
pub mod session;
pub mod store;

pub use config::SyncConfig;
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::{SyncError, SyncResult};
pub use identity::{CellIdentity, CellRecord, Revision, SheetId, SheetSnapshot};
pub use materialize::{column_label, materialize, GridFrame};
pub use memory::InMemorySheetBackend;
pub use pipeline::{MutationId, MutationStatus, PendingMutation};
pub use remote::{ChangeEvent, ChangeFeed, CommitAck, CommitService, FeedSignal};
pub use session::{SheetHandle, SheetSession, SyncNotice};
