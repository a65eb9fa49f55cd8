//! Calendar discovery
//!
//! Fallback discovery path: query pilot users' calendars for online
//! meetings inside a time window.

use super::{GraphClient, GraphError};
use chrono::{DateTime, SecondsFormat, Utc};

/// Calendar events with an online meeting, for one user, within a window.
pub async fn online_meetings_in_window(
    client: &GraphClient,
    user_email: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<serde_json::Value>, GraphError> {
    let start_str = start.to_rfc3339_opts(SecondsFormat::Secs, true);
    let end_str = end.to_rfc3339_opts(SecondsFormat::Secs, true);

    let response = client
        .get_with_query(
            &format!("/users/{user_email}/calendarView"),
            &[
                ("startDateTime", start_str.as_str()),
                ("endDateTime", end_str.as_str()),
                ("$top", "100"),
            ],
        )
        .await?;

    let events = response
        .get("value")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|e| {
                    e.get("isOnlineMeeting")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    Ok(events)
}
