//! Proposal lifecycle.
//!
//! ```text
//!            propose             accept
//!   NONE ─────────────▶ PENDING ─────────▶ ACCEPTED
//!     │                    │
//!     │ auto-accept        │ decline
//!     └──────▶ ACCEPTED    └─────────▶ DECLINED
//!
//!   withdraw: any state ─▶ NONE
//! ```
//!
//! `RequestState::apply` is the only place legal transitions are decided.
//! Stores persist PENDING and ACCEPTED rows; DECLINED rows are deleted on
//! commit, so a key observed after a decline reads as NONE.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestState {
    None,
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    Propose,
    /// Follow to a public profile skips PENDING
    AutoAccept,
    Accept,
    Decline,
    Withdraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {event:?} a request in state {from:?}")]
pub struct TransitionError {
    pub from: RequestState,
    pub event: RequestEvent,
}

impl From<TransitionError> for AppError {
    fn from(e: TransitionError) -> Self {
        let message = match (e.from, e.event) {
            (RequestState::Pending, RequestEvent::Propose | RequestEvent::AutoAccept) => {
                "a pending request already exists".to_string()
            }
            (RequestState::Accepted, RequestEvent::Propose | RequestEvent::AutoAccept) => {
                "relation already exists".to_string()
            }
            (RequestState::None, RequestEvent::Accept | RequestEvent::Decline) => {
                return AppError::NotFound("no pending request".into())
            }
            _ => e.to_string(),
        };
        AppError::Conflict(message)
    }
}

impl RequestState {
    pub fn apply(self, event: RequestEvent) -> Result<RequestState, TransitionError> {
        use RequestEvent::*;
        use RequestState::*;

        match (self, event) {
            (_, Withdraw) => Ok(None),
            (None, Propose) => Ok(Pending),
            (None, AutoAccept) => Ok(Accepted),
            (Pending, Accept) => Ok(Accepted),
            (Pending, Decline) => Ok(Declined),
            (from, event) => Err(TransitionError { from, event }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::None => "NONE",
            RequestState::Pending => "PENDING",
            RequestState::Accepted => "ACCEPTED",
            RequestState::Declined => "DECLINED",
        }
    }

    /// Stored status column; only persisted states parse.
    pub fn parse_stored(s: &str) -> Result<Self, AppError> {
        match s {
            "pending" => Ok(RequestState::Pending),
            "accepted" => Ok(RequestState::Accepted),
            other => Err(AppError::Internal(format!("unexpected request status: {}", other))),
        }
    }

    pub fn stored_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Accepted => "accepted",
            RequestState::Declined => "declined",
            RequestState::None => "none",
        }
    }
}
