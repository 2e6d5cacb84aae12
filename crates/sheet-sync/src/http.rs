//! REST adapter for the commit service.
//!
//! `PUT {base}/sheets/{id}/cells/{row}/{col}` with `{"value": ..}` answers a
//! [`CommitAck`]; `GET {base}/sheets/{id}/cells` answers a [`SheetSnapshot`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::identity::{CellIdentity, SheetId, SheetSnapshot};
use crate::remote::{CommitAck, CommitService};

#[derive(Serialize)]
struct CommitBody<'a> {
    value: &'a str,
}

#[derive(Clone)]
pub struct HttpCommitService {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpCommitService {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn read_json<T: DeserializeOwned>(res: Response) -> SyncResult<T> {
    let bytes = res.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn unexpected(res: Response) -> SyncError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    SyncError::UnexpectedStatus { status, body }
}

#[async_trait]
impl CommitService for HttpCommitService {
    async fn commit_cell(
        &self,
        sheet: &SheetId,
        row: u32,
        col: u32,
        value: &str,
    ) -> SyncResult<CommitAck> {
        let url = self.endpoint(&[
            "sheets",
            sheet.as_str(),
            "cells",
            &row.to_string(),
            &col.to_string(),
        ])?;
        debug!(target = "sheet.http", %url, "commit cell");
        let res = self
            .authorize(self.http.put(url))
            .json(&CommitBody { value })
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            read_json(res).await
        } else if status.is_client_error() {
            let body = res.text().await.unwrap_or_default();
            let reason = if body.trim().is_empty() {
                status.to_string()
            } else {
                body
            };
            Err(SyncError::CommitRejected {
                identity: CellIdentity::new(sheet.clone(), row, col),
                reason,
            })
        } else {
            Err(unexpected(res).await)
        }
    }

    async fn fetch_sheet(&self, sheet: &SheetId) -> SyncResult<SheetSnapshot> {
        let url = self.endpoint(&["sheets", sheet.as_str(), "cells"])?;
        debug!(target = "sheet.http", %url, "fetch sheet");
        let res = self.authorize(self.http.get(url)).send().await?;
        if !res.status().is_success() {
            return Err(unexpected(res).await);
        }
        let snapshot: SheetSnapshot = read_json(res).await?;
        Ok(SheetSnapshot::from_records(sheet.clone(), snapshot.records))
    }
}
