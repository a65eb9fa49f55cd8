//! Outbound mail
//!
//! Sends on behalf of the shared mailbox configured as the sender.

use super::{GraphClient, GraphError};
use serde_json::json;

/// Send an HTML email to one recipient from the shared mailbox.
pub async fn send_mail(
    client: &GraphClient,
    from: &str,
    recipient: &str,
    subject: &str,
    html_body: &str,
) -> Result<(), GraphError> {
    let payload = json!({
        "message": {
            "subject": subject,
            "body": {
                "contentType": "HTML",
                "content": html_body,
            },
            "toRecipients": [
                { "emailAddress": { "address": recipient } }
            ],
        },
        "saveToSentItems": false,
    });

    client
        .post(&format!("/users/{from}/sendMail"), &payload)
        .await?;
    Ok(())
}
