//! # Microsoft Graph Delta Client
//!
//! [`CalendarSource`] implementation over the Graph `events/delta` endpoint.
//!
//! ## Request Shapes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Full          GET {base}/users/{owner}/calendars/{cal}/events/delta    │
//! │  Delta(T)      GET ...same path...?$deltatoken=T                        │
//! │  Next(link)    GET {link}   (absolute @odata.nextLink)                  │
//! │                                                                         │
//! │  owner == "me" uses {base}/me/... instead of /users/{owner}/...         │
//! │                                                                         │
//! │  Headers:  Authorization: Bearer <token>                                │
//! │            Prefer: odata.maxpagesize=N, outlook.timezone="UTC"          │
//! │                                                                         │
//! │  Response: value[]  +  @odata.nextLink | @odata.deltaLink               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Retry Policy
//! Transient failures (408/429/5xx, connection errors, undecodable bodies)
//! are retried with exponential backoff up to `max_retries` times. 410 and
//! auth failures are returned immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use calsync_core::enrichment::strip_html;
use calsync_core::{RemoteAttendee, RemoteDateTime, RemoteEvent};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::GraphSettings;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::source::{CalendarSource, DeltaPage, PageRequest};

/// Owner id that maps to the signed-in user's `/me` routes.
pub const SIGNED_IN_USER: &str = "me";

// =============================================================================
// Access Tokens
// =============================================================================

/// Supplies bearer tokens for Graph requests.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, RemoteError>;
}

/// A fixed token (CLI use and tests).
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken(token.into())
    }
}

#[async_trait]
impl AccessTokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, RemoteError> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct GraphDeltaResponse {
    #[serde(default)]
    value: Vec<GraphEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    id: String,
    #[serde(rename = "iCalUId")]
    ical_uid: Option<String>,
    subject: Option<String>,
    start: Option<GraphDateTime>,
    end: Option<GraphDateTime>,
    is_all_day: Option<bool>,
    location: Option<GraphLocation>,
    categories: Option<Vec<String>>,
    body: Option<GraphBody>,
    body_preview: Option<String>,
    attendees: Option<Vec<GraphAttendee>>,
    last_modified_date_time: Option<DateTime<Utc>>,
    change_key: Option<String>,
    online_meeting: Option<GraphOnlineMeeting>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
    time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphLocation {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttendee {
    email_address: Option<GraphEmailAddress>,
    status: Option<GraphResponseStatus>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphResponseStatus {
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphOnlineMeeting {
    join_url: Option<String>,
}

impl GraphEvent {
    fn into_remote(self) -> RemoteEvent {
        if self.removed.is_some() {
            return RemoteEvent::tombstone(self.id);
        }

        let body = self.body.and_then(|b| {
            let content = b.content.filter(|c| !c.trim().is_empty())?;
            let is_html = b
                .content_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("html"));
            Some(if is_html { strip_html(&content) } else { content })
        });

        let attendees = self
            .attendees
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| {
                let email = a.email_address?;
                Some(RemoteAttendee {
                    name: email.name,
                    email: email.address?,
                    response: a.status.and_then(|s| s.response),
                })
            })
            .collect();

        RemoteEvent {
            id: self.id,
            global_uid: self.ical_uid,
            subject: self.subject,
            start: self.start.map(GraphDateTime::into_remote),
            end: self.end.map(GraphDateTime::into_remote),
            is_all_day: self.is_all_day.unwrap_or(false),
            location: self
                .location
                .and_then(|l| l.display_name)
                .filter(|l| !l.trim().is_empty()),
            categories: self.categories.unwrap_or_default(),
            body,
            body_preview: self.body_preview,
            attendees,
            last_modified: self.last_modified_date_time,
            change_key: self.change_key,
            online_meeting_url: self.online_meeting.and_then(|m| m.join_url),
            removed: false,
        }
    }
}

impl GraphDateTime {
    fn into_remote(self) -> RemoteDateTime {
        RemoteDateTime {
            date_time: self.date_time,
            time_zone: self.time_zone,
        }
    }
}

/// Pulls the `$deltatoken` out of a delta link.
///
/// Falls back to the whole link when no such parameter exists; such a
/// "token" is later requested verbatim.
pub fn extract_delta_token(delta_link: &str) -> String {
    Url::parse(delta_link)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "$deltatoken")
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_else(|| delta_link.to_string())
}

// =============================================================================
// Graph Client
// =============================================================================

/// HTTP client for the Graph delta endpoint.
#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: Url,
    settings: GraphSettings,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl std::fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url.as_str())
            .field("page_size", &self.settings.page_size)
            .finish()
    }
}

impl GraphClient {
    /// Creates a client from validated settings.
    pub fn new(settings: GraphSettings, tokens: Arc<dyn AccessTokenProvider>) -> SyncResult<Self> {
        let base_url = Url::parse(settings.base_url.trim_end_matches('/'))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(settings.base_url.clone()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(GraphClient {
            http,
            base_url,
            settings,
            tokens,
        })
    }

    /// URL of the delta endpoint for one calendar.
    fn delta_url(&self, owner_id: &str, calendar_id: &str) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::transient("base URL cannot carry a path"))?;
            segments.pop_if_empty();
            if owner_id == SIGNED_IN_USER {
                segments.push(SIGNED_IN_USER);
            } else {
                segments.push("users").push(owner_id);
            }
            segments
                .push("calendars")
                .push(calendar_id)
                .push("events")
                .push("delta");
        }
        Ok(url)
    }

    fn request_url(
        &self,
        owner_id: &str,
        calendar_id: &str,
        request: &PageRequest,
    ) -> Result<Url, RemoteError> {
        match request {
            PageRequest::Full => self.delta_url(owner_id, calendar_id),
            PageRequest::Delta(token) if token.starts_with("http") => Url::parse(token)
                .map_err(|e| RemoteError::transient(format!("stored delta link is invalid: {e}"))),
            PageRequest::Delta(token) => {
                let mut url = self.delta_url(owner_id, calendar_id)?;
                url.query_pairs_mut().append_pair("$deltatoken", token);
                Ok(url)
            }
            PageRequest::Next(link) => Url::parse(link)
                .map_err(|e| RemoteError::transient(format!("continuation link is invalid: {e}"))),
        }
    }

    /// Sends one request, no retries.
    async fn send_once(&self, url: &Url) -> Result<DeltaPage, RemoteError> {
        let token = self.tokens.access_token().await?;

        let response = self
            .http
            .get(url.clone())
            .bearer_auth(token)
            .header(
                "Prefer",
                format!(
                    "odata.maxpagesize={}, outlook.timezone=\"UTC\"",
                    self.settings.page_size
                ),
            )
            .send()
            .await
            .map_err(|e| RemoteError::transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), &body));
        }

        let body: GraphDeltaResponse = response.json().await.map_err(|e| RemoteError::Transient {
            status: Some(status.as_u16()),
            message: format!("undecodable delta response: {e}"),
        })?;

        Ok(DeltaPage {
            items: body.value.into_iter().map(GraphEvent::into_remote).collect(),
            continuation: body.next_link,
            new_delta_token: body.delta_link.as_deref().map(extract_delta_token),
        })
    }
}

#[async_trait]
impl CalendarSource for GraphClient {
    async fn fetch_page(
        &self,
        owner_id: &str,
        calendar_id: &str,
        request: PageRequest,
    ) -> Result<DeltaPage, RemoteError> {
        let url = self.request_url(owner_id, calendar_id, &request)?;
        let mut backoff = self.settings.backoff();
        let mut attempt = 0u32;

        loop {
            match self.send_once(&url).await {
                Ok(page) => {
                    debug!(
                        owner_id,
                        calendar_id,
                        items = page.items.len(),
                        has_more = page.continuation.is_some(),
                        "Fetched delta page"
                    );
                    return Ok(page);
                }
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(self.settings.max_backoff_secs));
                    warn!(
                        owner_id,
                        calendar_id,
                        attempt,
                        ?delay,
                        error = %err,
                        "Transient Graph failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard, max_retries: u32) -> GraphClient {
        let settings = GraphSettings {
            base_url: server.url(),
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_secs: 1,
            ..Default::default()
        };
        GraphClient::new(settings, Arc::new(StaticToken::new("t0k"))).unwrap()
    }

    const PATH: &str = "/users/alice/calendars/cal-1/events/delta";

    #[tokio::test]
    async fn test_full_page_maps_items() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "value": [
                {
                    "id": "AAMk-1",
                    "iCalUId": "uid-1",
                    "subject": "Choir practice",
                    "start": {"dateTime": "2024-03-01T18:00:00.0000000", "timeZone": "UTC"},
                    "end": {"dateTime": "2024-03-01T19:30:00.0000000", "timeZone": "UTC"},
                    "isAllDay": false,
                    "location": {"displayName": "Main Chapel"},
                    "categories": ["Music"],
                    "body": {"contentType": "html", "content": "<p>Setup: 30 min</p>"},
                    "attendees": [
                        {"emailAddress": {"name": "Jane", "address": "jane@example.org"},
                         "status": {"response": "accepted"}},
                        {"emailAddress": {"name": "No Address"}}
                    ],
                    "lastModifiedDateTime": "2024-02-20T08:15:00.1234567Z",
                    "onlineMeeting": null
                },
                {"id": "AAMk-2", "@removed": {"reason": "deleted"}}
            ],
            "@odata.deltaLink": format!("{}{}?$deltatoken=next-token", server.url(), PATH)
        });
        let mock = server
            .mock("GET", PATH)
            .match_header("authorization", "Bearer t0k")
            .match_header("prefer", Matcher::Regex("odata.maxpagesize=50".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let page = client_for(&server, 0)
            .fetch_page("alice", "cal-1", PageRequest::Full)
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(page.items.len(), 2);
        let first = &page.items[0];
        assert_eq!(first.global_uid.as_deref(), Some("uid-1"));
        assert_eq!(first.location.as_deref(), Some("Main Chapel"));
        assert_eq!(first.body.as_deref(), Some("Setup: 30 min"));
        assert_eq!(first.attendees.len(), 1);
        assert!(first.last_modified.is_some());
        assert!(page.items[1].removed);
        assert!(page.continuation.is_none());
        assert_eq!(page.new_delta_token.as_deref(), Some("next-token"));
    }

    #[tokio::test]
    async fn test_delta_request_sends_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .match_query(Matcher::UrlEncoded("$deltatoken".into(), "abc".into()))
            .with_status(200)
            .with_body(r#"{"value": [], "@odata.deltaLink": "https://graph/x?$deltatoken=def"}"#)
            .create_async()
            .await;

        let page = client_for(&server, 0)
            .fetch_page("alice", "cal-1", PageRequest::Delta("abc".into()))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(page.new_delta_token.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn test_next_link_followed_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page2")
            .match_query(Matcher::UrlEncoded("$skiptoken".into(), "s1".into()))
            .with_status(200)
            .with_body(format!(
                r#"{{"value": [], "@odata.nextLink": "{}/page3?$skiptoken=s2"}}"#,
                server.url()
            ))
            .create_async()
            .await;

        let link = format!("{}/page2?$skiptoken=s1", server.url());
        let page = client_for(&server, 0)
            .fetch_page("alice", "cal-1", PageRequest::Next(link))
            .await
            .unwrap();
        mock.assert_async().await;
        assert!(page.continuation.unwrap().ends_with("/page3?$skiptoken=s2"));
        assert!(page.new_delta_token.is_none());
    }

    #[tokio::test]
    async fn test_gone_maps_to_cursor_expired() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .match_query(Matcher::Any)
            .with_status(410)
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&server, 3)
            .fetch_page("alice", "cal-1", PageRequest::Delta("stale".into()))
            .await
            .unwrap_err();
        mock.assert_async().await;
        assert_eq!(err, RemoteError::CursorExpired);
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal_and_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(401)
            .with_body("InvalidAuthenticationToken")
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&server, 3)
            .fetch_page("alice", "cal-1", PageRequest::Full)
            .await
            .unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, RemoteError::FatalAuth { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_transient_retried_then_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = client_for(&server, 2)
            .fetch_page("alice", "cal-1", PageRequest::Full)
            .await
            .unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, RemoteError::Transient { status: Some(503), .. }));
    }

    #[tokio::test]
    async fn test_me_routes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me/calendars/cal-1/events/delta")
            .with_status(200)
            .with_body(r#"{"value": [], "@odata.deltaLink": "opaque"}"#)
            .create_async()
            .await;

        let page = client_for(&server, 0)
            .fetch_page(SIGNED_IN_USER, "cal-1", PageRequest::Full)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(page.new_delta_token.as_deref(), Some("opaque"));
    }

    #[test]
    fn test_extract_delta_token() {
        assert_eq!(
            extract_delta_token("https://graph.microsoft.com/v1.0/me/events/delta?$deltatoken=Xy%3D"),
            "Xy="
        );
        assert_eq!(extract_delta_token("not a url"), "not a url");
    }
}
