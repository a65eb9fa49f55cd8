//! Meeting transcripts
//!
//! Transcript listing goes through getAllTranscripts for the organiser;
//! content downloads come back as WebVTT.

use super::{GraphClient, GraphError};

/// Transcript metadata from the listing endpoint.
#[derive(Debug, Clone)]
pub struct TranscriptMeta {
    pub id: String,
    pub meeting_id: Option<String>,
    pub created_date_time: Option<String>,
}

/// List every transcript for meetings organised by the given user.
pub async fn list_for_organizer(
    client: &GraphClient,
    organizer_user_id: &str,
) -> Result<Vec<TranscriptMeta>, GraphError> {
    let endpoint = format!(
        "/users/{organizer_user_id}/onlineMeetings/getAllTranscripts(meetingOrganizerUserId='{organizer_user_id}')"
    );
    let response = client.get(&endpoint).await?;

    let transcripts = response
        .get("value")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| {
                    Some(TranscriptMeta {
                        id: t.get("id")?.as_str()?.to_string(),
                        meeting_id: t
                            .get("meetingId")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                        created_date_time: t
                            .get("createdDateTime")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(transcripts)
}

/// Download transcript content as WebVTT under the given user's identity.
pub async fn download_content(
    client: &GraphClient,
    user_id: &str,
    meeting_id: &str,
    transcript_id: &str,
) -> Result<String, GraphError> {
    let endpoint = format!(
        "/users/{user_id}/onlineMeetings/{meeting_id}/transcripts/{transcript_id}/content"
    );
    client.get_text(&endpoint, "text/vtt").await
}
