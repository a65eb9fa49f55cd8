//! Directory lookups
//!
//! Call record sessions carry user GUIDs but rarely emails, so participant
//! enumeration and alias handling both go through here.

use super::{GraphClient, GraphError};

/// Directory user as the handler needs it.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    #[allow(dead_code)] // enrichment field for email rendering
    pub job_title: Option<String>,
}

/// Look up a user by GUID or email address.
pub async fn lookup_user(client: &GraphClient, id_or_email: &str) -> Result<UserInfo, GraphError> {
    let value = client.get(&format!("/users/{id_or_email}")).await?;
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GraphError::Decode("user response missing id".to_string()))?
        .to_string();

    let email = value
        .get("mail")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("userPrincipalName").and_then(|v| v.as_str()))
        .map(|s| s.to_lowercase());

    Ok(UserInfo {
        id,
        email,
        display_name: value
            .get("displayName")
            .and_then(|v| v.as_str())
            .map(String::from),
        job_title: value
            .get("jobTitle")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

/// Resolve an address that may be an alias to the directory's primary
/// address. Graph resolves aliases transparently on the /users endpoint,
/// so the primary is whatever the directory returns for the alias.
pub async fn resolve_alias(
    client: &GraphClient,
    alias_email: &str,
) -> Result<UserInfo, GraphError> {
    lookup_user(client, alias_email).await
}
