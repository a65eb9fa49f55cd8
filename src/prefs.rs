//! User preferences
//!
//! Opt-in state for summary emails. Lookups are alias-tolerant: Microsoft
//! aliases differ from the primary address mostly by dots in the local
//! part, so comparisons use a lowercased, dot-collapsed key.

use crate::db::{Database, DbResult};
use crate::graph::{users, GraphClient, GraphError};
use chrono::{Duration, Utc};

/// Alias cache entries older than this are re-resolved on next use.
const ALIAS_TTL_DAYS: i64 = 7;

/// Normalize an email for comparison: lowercase, dots stripped from the
/// local part. `Scott.Schatz@x.com` and `scottschatz@x.com` compare equal.
pub fn normalize_email(email: &str) -> String {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) => format!("{}@{domain}", local.replace('.', "")),
        None => email,
    }
}

/// Preference decisions for the ingestion gate and the distributor.
#[derive(Clone)]
pub struct PreferenceManager {
    db: Database,
}

impl PreferenceManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Whether this address has opted in to email summaries.
    ///
    /// Unknown addresses default to false (fail-closed): nobody receives
    /// mail they didn't ask for. Comparison is alias-tolerant.
    pub fn is_opted_in(&self, email: &str) -> bool {
        if email.is_empty() {
            return false;
        }
        let wanted = normalize_email(email);

        match self.db.subscribed_users() {
            Ok(subscribers) => subscribers
                .iter()
                .any(|pref| normalize_email(&pref.user_email) == wanted),
            Err(e) => {
                tracing::error!(email, error = %e, "Preference lookup failed");
                false
            }
        }
    }

    /// Full decision for one recipient of one meeting, in priority order:
    /// 1. meeting-level distribution disable (organizer)
    /// 2. per-meeting preference override
    /// 3. user-level preference
    /// 4. default: opt-in false
    pub fn should_send_email(&self, email: &str, meeting_id: i64) -> bool {
        let meeting = match self.db.get_meeting(meeting_id) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(meeting_id, error = %e, "Meeting lookup failed, suppressing email");
                return false;
            }
        };
        if !meeting.distribution_enabled {
            tracing::info!(
                meeting_id,
                disabled_by = meeting.distribution_disabled_by.as_deref().unwrap_or("unknown"),
                email,
                "Distribution disabled for meeting"
            );
            return false;
        }

        match self.db.meeting_preference(email, meeting_id) {
            Ok(Some(receive)) => receive,
            Ok(None) => self.is_opted_in(email),
            Err(e) => {
                tracing::error!(email, meeting_id, error = %e, "Meeting preference lookup failed");
                false
            }
        }
    }

    pub fn set_user_preference(
        &self,
        email: &str,
        receive_emails: bool,
        updated_by: &str,
    ) -> DbResult<()> {
        self.db
            .upsert_user_preference(email, None, receive_emails, updated_by)
    }

    pub fn set_meeting_preference(
        &self,
        email: &str,
        meeting_id: i64,
        receive_emails: bool,
        updated_by: &str,
    ) -> DbResult<()> {
        self.db
            .set_meeting_preference(email, meeting_id, receive_emails, updated_by)
    }

    /// Resolve an address that may be an alias to its primary address,
    /// using the cache when it is younger than the TTL.
    #[allow(dead_code)] // API completeness; inbox commands resolve through here
    pub async fn resolve_primary_email(
        &self,
        client: &GraphClient,
        email: &str,
    ) -> Result<String, GraphError> {
        let lowered = email.to_lowercase();

        if let Ok(Some(cached)) = self.db.get_alias(&lowered) {
            if Utc::now() - cached.resolved_at < Duration::days(ALIAS_TTL_DAYS) {
                return Ok(cached.primary_email);
            }
        }

        let user = users::resolve_alias(client, &lowered).await?;
        let primary = user.email.unwrap_or_else(|| lowered.clone());
        if let Err(e) = self.db.upsert_alias(&lowered, &primary, Some(user.id.as_str())) {
            tracing::warn!(email = lowered, error = %e, "Failed to cache alias resolution");
        }
        Ok(primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMeeting;

    fn setup() -> (Database, PreferenceManager, i64) {
        let db = Database::open_in_memory().unwrap();
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Weekly Sync".to_string(),
                ..Default::default()
            })
            .unwrap();
        let prefs = PreferenceManager::new(db.clone());
        (db, prefs, meeting_id)
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("Scott.Schatz@Example.com"), "scottschatz@example.com");
        assert_eq!(normalize_email("plain@example.com"), "plain@example.com");
        assert_eq!(normalize_email("  Trimmed@X.com "), "trimmed@x.com");
        // domain dots are untouched
        assert_eq!(normalize_email("a.b@mail.example.com"), "ab@mail.example.com");
        assert_eq!(normalize_email("no-at-sign"), "no-at-sign");
    }

    #[test]
    fn test_unknown_email_defaults_closed() {
        let (_db, prefs, _) = setup();
        assert!(!prefs.is_opted_in("stranger@example.com"));
        assert!(!prefs.is_opted_in(""));
    }

    #[test]
    fn test_alias_tolerant_optin() {
        let (_db, prefs, _) = setup();
        prefs
            .set_user_preference("scott.schatz@example.com", true, "user")
            .unwrap();

        assert!(prefs.is_opted_in("scottschatz@example.com"));
        assert!(prefs.is_opted_in("Scott.Schatz@example.com"));
        assert!(!prefs.is_opted_in("scott@example.com"));
    }

    #[test]
    fn test_should_send_email_priority_chain() {
        let (db, prefs, meeting_id) = setup();

        // default: opt-in false
        assert!(!prefs.should_send_email("u@x.com", meeting_id));

        // user-level opt-in
        prefs.set_user_preference("u@x.com", true, "user").unwrap();
        assert!(prefs.should_send_email("u@x.com", meeting_id));

        // per-meeting override wins over the user preference
        prefs
            .set_meeting_preference("u@x.com", meeting_id, false, "user")
            .unwrap();
        assert!(!prefs.should_send_email("u@x.com", meeting_id));

        // meeting-level disable wins over everything
        let other = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-B".to_string(),
                subject: "Other".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(prefs.should_send_email("u@x.com", other));
        db.disable_distribution(other, "organizer@x.com").unwrap();
        assert!(!prefs.should_send_email("u@x.com", other));
    }

    #[test]
    fn test_per_meeting_optout_is_scoped() {
        let (db, prefs, meeting_a) = setup();
        let meeting_b = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-B".to_string(),
                subject: "Other".to_string(),
                ..Default::default()
            })
            .unwrap();

        prefs.set_user_preference("u@x.com", true, "user").unwrap();
        prefs
            .set_meeting_preference("u@x.com", meeting_a, false, "user")
            .unwrap();

        assert!(!prefs.should_send_email("u@x.com", meeting_a));
        assert!(prefs.should_send_email("u@x.com", meeting_b));
    }
}
