//! Test fixtures: a scripted [`CalendarSource`] and remote event builders.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use calsync_core::{RemoteDateTime, RemoteEvent};
use chrono::{TimeZone, Utc};

use crate::error::RemoteError;
use crate::source::{CalendarSource, DeltaPage, PageRequest};

/// Returns canned pages per calendar, in order, and records every request.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Result<DeltaPage, RemoteError>>>>,
    requests: Mutex<Vec<(String, PageRequest)>>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, calendar_id: &str, response: Result<DeltaPage, RemoteError>) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(calendar_id.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub(crate) fn requests_for(&self, calendar_id: &str) -> Vec<PageRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(cal, _)| cal == calendar_id)
            .map(|(_, req)| req.clone())
            .collect()
    }
}

#[async_trait]
impl CalendarSource for ScriptedSource {
    async fn fetch_page(
        &self,
        _owner_id: &str,
        calendar_id: &str,
        request: PageRequest,
    ) -> Result<DeltaPage, RemoteError> {
        self.requests
            .lock()
            .unwrap()
            .push((calendar_id.to_string(), request));

        self.scripts
            .lock()
            .unwrap()
            .get_mut(calendar_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(RemoteError::transient("script exhausted")))
    }
}

/// A one-hour event on 2024-03-01 starting at `hour` UTC.
pub(crate) fn remote_event(id: &str, global_uid: Option<&str>, subject: &str, hour: u32) -> RemoteEvent {
    RemoteEvent {
        id: id.to_string(),
        global_uid: global_uid.map(String::from),
        subject: Some(subject.to_string()),
        start: Some(RemoteDateTime::utc(format!("2024-03-01T{:02}:00:00", hour))),
        end: Some(RemoteDateTime::utc(format!("2024-03-01T{:02}:00:00", hour + 1))),
        last_modified: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
        ..Default::default()
    }
}
