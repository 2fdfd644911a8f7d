//! # Calendar Source
//!
//! The seam between the orchestrator and the remote calendar API.
//!
//! ## Page Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Full / Delta(token)                                                   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   ┌─────────┐  continuation = Some(link)   ┌─────────┐                 │
//! │   │ page 1  │ ───────────────────────────► │ page 2  │ ──► ...         │
//! │   └─────────┘       Next(link)             └─────────┘                 │
//! │                                                 │                       │
//! │                          continuation = None    │                       │
//! │                          new_delta_token = T ◄──┘                       │
//! │                                                                         │
//! │   Errors: RemoteError::{CursorExpired, Transient, FatalAuth}            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use calsync_core::RemoteEvent;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// What to ask the remote service for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageRequest {
    /// Start a fresh delta enumeration.
    Full,
    /// Continue from a stored delta token.
    Delta(String),
    /// Follow the continuation pointer of the previous page.
    Next(String),
}

/// One page of change records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaPage {
    pub items: Vec<RemoteEvent>,
    /// Set when more pages follow.
    pub continuation: Option<String>,
    /// Set on the final page only.
    pub new_delta_token: Option<String>,
}

impl DeltaPage {
    /// A page that ends the enumeration.
    pub fn last(items: Vec<RemoteEvent>, token: impl Into<String>) -> Self {
        DeltaPage {
            items,
            continuation: None,
            new_delta_token: Some(token.into()),
        }
    }

    /// A page with more to come.
    pub fn more(items: Vec<RemoteEvent>, continuation: impl Into<String>) -> Self {
        DeltaPage {
            items,
            continuation: Some(continuation.into()),
            new_delta_token: None,
        }
    }
}

/// Remote calendar delta-query surface.
///
/// Implementations perform their own per-request retries; an error
/// returned here is final for the page.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn fetch_page(
        &self,
        owner_id: &str,
        calendar_id: &str,
        request: PageRequest,
    ) -> Result<DeltaPage, RemoteError>;
}
