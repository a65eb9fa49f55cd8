//! Chat posting
//!
//! Posts summary messages into the meeting's chat thread.

use super::{GraphClient, GraphError};
use serde_json::json;

/// Post an HTML message to a chat thread; returns the message id.
pub async fn post_message(
    client: &GraphClient,
    chat_id: &str,
    html_content: &str,
) -> Result<Option<String>, GraphError> {
    let payload = json!({
        "body": {
            "contentType": "html",
            "content": html_content,
        }
    });

    let response = client
        .post(&format!("/chats/{chat_id}/messages"), &payload)
        .await?;
    Ok(response
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from))
}
