//! Call records
//!
//! A call record is the provider-side artifact for a completed call; its
//! sessions carry the participant identities.

use super::{GraphClient, GraphError};
use chrono::{DateTime, SecondsFormat, Utc};

/// Fetch a call record with its sessions expanded. Some tenants do not
/// return sessions on $expand, so fall back to the sessions endpoint.
pub async fn fetch_call_record(
    client: &GraphClient,
    call_record_id: &str,
) -> Result<serde_json::Value, GraphError> {
    let mut record = client
        .get_with_query(
            &format!("/communications/callRecords/{call_record_id}"),
            &[("$expand", "sessions")],
        )
        .await?;

    let missing_sessions = record
        .get("sessions")
        .and_then(|s| s.as_array())
        .map_or(true, |a| a.is_empty());

    if missing_sessions {
        let sessions = client
            .get(&format!(
                "/communications/callRecords/{call_record_id}/sessions"
            ))
            .await?;
        if let Some(obj) = record.as_object_mut() {
            obj.insert(
                "sessions".to_string(),
                sessions.get("value").cloned().unwrap_or_default(),
            );
        }
    }

    Ok(record)
}

/// List call records starting at or after the cutoff, following
/// @odata.nextLink until exhausted.
pub async fn list_call_records_since(
    client: &GraphClient,
    cutoff: DateTime<Utc>,
) -> Result<Vec<serde_json::Value>, GraphError> {
    let cutoff_str = cutoff.to_rfc3339_opts(SecondsFormat::Secs, true);
    let filter = format!("startDateTime ge {cutoff_str}");

    let mut records = Vec::new();
    let mut page = 1_u32;
    let mut response = client
        .get_with_query("/communications/callRecords", &[("$filter", filter.as_str())])
        .await?;

    loop {
        let batch = response
            .get("value")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        tracing::info!(page, count = batch.len(), "Fetched call records page");
        records.extend(batch);

        let Some(next) = response
            .get("@odata.nextLink")
            .and_then(|v| v.as_str())
            .map(String::from)
        else {
            break;
        };
        page += 1;
        response = client.get(&next).await?;
    }

    Ok(records)
}
