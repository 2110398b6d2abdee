//! Caller-side view of a request.

use super::execution::{RequestExecutionContext, TransferInfo};
use super::state::ClientState;
use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::engine::HandleId;
use crate::http::request::PushProfile;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use url::Url;

/// What changed for a handle during one `pump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The request made progress and is now in this state.
    Progressed(LoadState),
    /// The request reached a terminal state.
    Finished(LoadState),
}

impl Readiness {
    pub fn state(self) -> LoadState {
        match self {
            Readiness::Progressed(s) | Readiness::Finished(s) => s,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Readiness::Finished(_))
    }
}

/// Answer to an offered push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushVerdict {
    Ok,
    Deny,
}

/// Handle to one request started through a client.
///
/// Inspection methods drive the client until the request finishes. Once
/// finished, a failed or canceled request returns the same error on every
/// call. Dropping an unfinished handle cancels it on the next pump.
pub struct ResponseHandle {
    id: HandleId,
    client: Weak<ClientState>,
    record: Rc<RefCell<RequestExecutionContext>>,
    url: Url,
    profile: PushProfile,
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl ResponseHandle {
    pub(crate) fn new(
        id: HandleId,
        client: Weak<ClientState>,
        record: Rc<RefCell<RequestExecutionContext>>,
        url: Url,
        profile: PushProfile,
    ) -> Self {
        Self {
            id,
            client,
            record,
            url,
            profile,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn push_profile(&self) -> &PushProfile {
        &self.profile
    }

    pub fn state(&self) -> LoadState {
        self.record.borrow().state()
    }

    pub fn is_finished(&self) -> bool {
        self.record.borrow().is_terminal()
    }

    /// Diagnostics snapshot; does not wait.
    pub fn info(&self) -> TransferInfo {
        self.record.borrow().info()
    }

    /// Drives the client until this request finishes.
    ///
    /// Fails with [`NetError::ReentrantUse`] when called from inside a pump
    /// (e.g. a progress callback) before the request finished.
    pub fn wait(&self) -> Result<(), NetError> {
        loop {
            if let Some(result) = self.finished_result() {
                return result;
            }
            let Some(client) = self.client.upgrade() else {
                // The client is gone; its drop marked every request canceled.
                return self.finished_result().unwrap_or(Err(NetError::Canceled));
            };
            if client.is_performing() {
                return Err(NetError::ReentrantUse);
            }
            client.pump(&[self.id], None);
        }
    }

    fn finished_result(&self) -> Option<Result<(), NetError>> {
        let record = self.record.borrow();
        if !record.is_terminal() {
            return None;
        }
        Some(match record.terminal_error() {
            Some(e) => Err(e),
            None => Ok(()),
        })
    }

    pub fn status(&self) -> Result<StatusCode, NetError> {
        self.wait()?;
        self.record
            .borrow()
            .head()
            .map(|h| h.status)
            .ok_or(NetError::EmptyResponse)
    }

    pub fn headers(&self) -> Result<HeaderMap, NetError> {
        self.wait()?;
        self.record
            .borrow()
            .head()
            .map(|h| h.headers.clone())
            .ok_or(NetError::EmptyResponse)
    }

    pub fn content(&self) -> Result<Bytes, NetError> {
        self.wait()?;
        Ok(self.record.borrow().body())
    }

    /// Cancels the request. Idempotent.
    pub fn cancel(&self) {
        if let Some(client) = self.client.upgrade() {
            client.cancel(self.id);
        } else {
            self.record.borrow_mut().cancel();
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if self.is_finished() {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.abandon(self.id);
        }
    }
}
