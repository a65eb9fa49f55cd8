//! Subscription manager
//!
//! Keeps a valid callRecords change-notification subscription pointed at
//! the relay URL: ensure on startup, check every few minutes, renew inside
//! the expiry window, recreate daily, and alert (with cooldown) when the
//! provider refuses to cooperate. Down state is persisted to a marker file
//! so a restart still produces exactly one recovery alert.

use crate::config::Config;
use crate::db::{Database, SubscriptionEventType};
use crate::graph::{mail, GraphClient, GraphError};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const CALL_RECORDS_RESOURCE: &str = "/communications/callRecords";
const TRANSCRIPTS_RESOURCE: &str = "communications/onlineMeetings/getAllTranscripts";

/// Provider cap for callRecords subscriptions is 4230 minutes (~2.9 days);
/// 4200 leaves a buffer.
const CALL_RECORDS_MAX_EXPIRATION_MINUTES: i64 = 4200;

/// Renew when less than this many hours remain.
const RENEW_THRESHOLD_HOURS: i64 = 12;

const CHECK_INTERVAL_MINUTES: u64 = 5;

/// Hour of day (UTC) for the proactive daily recreation.
const DAILY_RECREATE_HOUR_UTC: u32 = 3;

/// Let the relay listener connect before the first creation attempt.
const STARTUP_DELAY_SECONDS: u64 = 5;

const MAX_CREATION_RETRIES: u32 = 5;
const RETRY_DELAY_SECONDS: u64 = 30;

const ALERT_COOLDOWN_HOURS: i64 = 6;

const CLIENT_STATE: &str = "meeting-scribe-secret";

/// An active provider-side subscription, as the manager cares about it.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// Filter a /subscriptions listing down to ours: matching resource and
/// notification URL.
pub fn matching_subscriptions(
    listing: &serde_json::Value,
    resource: &str,
    notification_url: &str,
) -> Vec<SubscriptionInfo> {
    listing
        .get("value")
        .and_then(|v| v.as_array())
        .map(|subs| {
            subs.iter()
                .filter(|sub| {
                    sub.get("resource").and_then(|v| v.as_str()) == Some(resource)
                        && sub.get("notificationUrl").and_then(|v| v.as_str())
                            == Some(notification_url)
                })
                .filter_map(|sub| {
                    Some(SubscriptionInfo {
                        id: sub.get("id")?.as_str()?.to_string(),
                        expiration: sub
                            .get("expirationDateTime")
                            .and_then(|v| v.as_str())
                            .and_then(parse_expiry),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether a subscription is inside the renewal window.
pub fn needs_renewal(expiration: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expiration {
        Some(expiry) => expiry <= now + Duration::hours(RENEW_THRESHOLD_HOURS),
        None => true,
    }
}

pub fn format_downtime(seconds: Option<i64>) -> String {
    match seconds {
        None => "Unknown".to_string(),
        Some(s) if s < 60 => format!("{s} seconds"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

#[derive(Default)]
struct AlertState {
    last_alert_time: Option<DateTime<Utc>>,
    subscription_down: bool,
    down_event_id: Option<i64>,
    down_timestamp: Option<DateTime<Utc>>,
}

pub struct SubscriptionManager {
    db: Database,
    graph: GraphClient,
    config: Arc<Config>,
    webhook_url: String,
    running: Arc<AtomicBool>,
    state: Mutex<AlertState>,
    state_file: PathBuf,
}

impl SubscriptionManager {
    pub fn new(db: Database, graph: GraphClient, config: Arc<Config>) -> Self {
        let webhook_url = config.relay.webhook_url();
        let state_file = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".meeting-scribe-subscription-state");

        let manager = Self {
            db,
            graph,
            config,
            webhook_url,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(AlertState::default()),
            state_file,
        };
        let was_down = manager.load_down_state();
        manager.state.lock().unwrap().subscription_down = was_down;
        if was_down {
            tracing::warn!("Loaded persisted subscription down state");
        }
        manager
    }

    #[cfg(test)]
    fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = path;
        let was_down = self.load_down_state();
        self.state.lock().unwrap().subscription_down = was_down;
        self
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // ========================= down-state file =========================

    fn load_down_state(&self) -> bool {
        match std::fs::read_to_string(&self.state_file) {
            Ok(content) => content.trim() == "down",
            Err(_) => false,
        }
    }

    fn save_down_state(&self, is_down: bool) {
        let result = if is_down {
            std::fs::write(&self.state_file, "down")
        } else {
            match std::fs::remove_file(&self.state_file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to persist subscription state");
        }
    }

    // ========================= provider calls =========================

    /// Active callRecords subscriptions pointing at our relay URL.
    pub async fn list_our_subscriptions(&self) -> Result<Vec<SubscriptionInfo>, GraphError> {
        let listing = self.graph.get("/subscriptions").await?;
        Ok(matching_subscriptions(
            &listing,
            CALL_RECORDS_RESOURCE,
            &self.webhook_url,
        ))
    }

    /// All subscriptions, unfiltered (CLI listing).
    pub async fn list_all_subscriptions(&self) -> Result<serde_json::Value, GraphError> {
        self.graph.get("/subscriptions").await
    }

    /// Create a callRecords subscription with the maximum allowed expiry.
    pub async fn create_subscription(&self, source: &str) -> Option<String> {
        self.create_with_expiration(
            CALL_RECORDS_RESOURCE,
            Duration::minutes(CALL_RECORDS_MAX_EXPIRATION_MINUTES),
            source,
        )
        .await
    }

    /// Create a callRecords subscription with an explicit lifetime, capped
    /// at the provider maximum (CLI `subscribe --expiration-days`).
    pub async fn create_subscription_with_minutes(
        &self,
        expiration_minutes: i64,
        source: &str,
    ) -> Option<String> {
        let minutes = expiration_minutes.min(CALL_RECORDS_MAX_EXPIRATION_MINUTES);
        self.create_with_expiration(CALL_RECORDS_RESOURCE, Duration::minutes(minutes), source)
            .await
    }

    /// Create a transcripts subscription. Transcript subscriptions have a
    /// much shorter provider cap, so the expiry is caller-supplied.
    pub async fn create_transcripts_subscription(
        &self,
        expiration_minutes: i64,
        source: &str,
    ) -> Option<String> {
        self.create_with_expiration(
            TRANSCRIPTS_RESOURCE,
            Duration::minutes(expiration_minutes),
            source,
        )
        .await
    }

    async fn create_with_expiration(
        &self,
        resource: &str,
        lifetime: Duration,
        source: &str,
    ) -> Option<String> {
        let expiry = Utc::now() + lifetime;
        let payload = json!({
            "changeType": "created",
            "notificationUrl": self.webhook_url,
            "resource": resource,
            "expirationDateTime": expiry.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "clientState": CLIENT_STATE,
        });

        tracing::info!(resource, %expiry, "Creating subscription");
        match self.graph.post("/subscriptions", &payload).await {
            Ok(response) => {
                let id = response
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                tracing::info!(subscription_id = id, "✓ Subscription created");
                self.log_event(SubscriptionEventType::Created, source, Some(id.as_str()), None, None, None);
                self.check_and_send_recovery_alert(source, Some(id.as_str())).await;
                Some(id)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to create subscription");
                self.log_event(
                    SubscriptionEventType::Failed,
                    source,
                    None,
                    Some(e.to_string().as_str()),
                    None,
                    None,
                );
                None
            }
        }
    }

    pub async fn delete_subscription(&self, subscription_id: &str) -> bool {
        match self
            .graph
            .delete(&format!("/subscriptions/{subscription_id}"))
            .await
        {
            Ok(()) => {
                tracing::info!(subscription_id, "Deleted subscription");
                true
            }
            Err(e) => {
                tracing::error!(subscription_id, error = %e, "Failed to delete subscription");
                false
            }
        }
    }

    pub async fn renew_subscription(&self, subscription_id: &str, source: &str) -> bool {
        let new_expiry = Utc::now() + Duration::minutes(CALL_RECORDS_MAX_EXPIRATION_MINUTES);
        let payload = json!({
            "expirationDateTime": new_expiry.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        });

        tracing::info!(subscription_id, %new_expiry, "Renewing subscription");
        match self
            .graph
            .patch(&format!("/subscriptions/{subscription_id}"), &payload)
            .await
        {
            Ok(_) => {
                tracing::info!(subscription_id, "✓ Subscription renewed");
                self.log_event(
                    SubscriptionEventType::Renewed,
                    source,
                    Some(subscription_id),
                    None,
                    None,
                    None,
                );
                self.check_and_send_recovery_alert(source, Some(subscription_id))
                    .await;
                true
            }
            Err(e) => {
                tracing::error!(subscription_id, error = %e, "Failed to renew subscription");
                self.log_event(
                    SubscriptionEventType::Failed,
                    source,
                    Some(subscription_id),
                    Some(e.to_string().as_str()),
                    None,
                    None,
                );
                false
            }
        }
    }

    /// Renew every matching subscription inside the window. Returns the
    /// number renewed (CLI `renew-all`).
    pub async fn renew_all(&self, min_hours_remaining: i64) -> Result<usize, GraphError> {
        let subs = self.list_our_subscriptions().await?;
        let threshold = Utc::now() + Duration::hours(min_hours_remaining);
        let mut renewed = 0;
        for sub in subs {
            let inside_window = sub.expiration.map_or(true, |expiry| expiry <= threshold);
            if inside_window && self.renew_subscription(&sub.id, "manual").await {
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    /// Ensure at least one valid subscription exists: reuse a healthy one,
    /// renew one inside the window, or create from scratch.
    pub async fn ensure_subscription(&self, source: &str) -> bool {
        tracing::debug!("Checking subscription status");
        let subscriptions = match self.list_our_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list subscriptions");
                Vec::new()
            }
        };

        if subscriptions.is_empty() {
            tracing::warn!("No callRecords subscriptions found, creating one");
            return self.create_subscription(source).await.is_some();
        }

        let now = Utc::now();
        for sub in &subscriptions {
            if !needs_renewal(sub.expiration, now) {
                if let Some(expiry) = sub.expiration {
                    let hours_remaining = (expiry - now).num_minutes() as f64 / 60.0;
                    tracing::info!(
                        subscription_id = sub.id,
                        hours_remaining,
                        "✓ Valid subscription found"
                    );
                }
                self.check_and_send_recovery_alert(source, Some(sub.id.as_str())).await;
                return true;
            }

            tracing::warn!(subscription_id = sub.id, "Subscription expiring soon, renewing");
            if self.renew_subscription(&sub.id, source).await {
                return true;
            }
            // renewal failed: replace it
            tracing::warn!(subscription_id = sub.id, "Renewal failed, recreating");
            self.delete_subscription(&sub.id).await;
            return self.create_subscription(source).await.is_some();
        }

        tracing::warn!("No valid subscriptions found, creating new one");
        self.create_subscription(source).await.is_some()
    }

    /// Daily refresh: delete everything matching, create fresh.
    pub async fn recreate_subscription(&self, source: &str) -> bool {
        tracing::info!("Proactively recreating callRecords subscription");
        if let Ok(subs) = self.list_our_subscriptions().await {
            for sub in subs {
                self.delete_subscription(&sub.id).await;
            }
        }
        self.create_subscription(source).await.is_some()
    }

    fn mark_subscription_down(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.subscription_down {
            state.subscription_down = true;
        }
    }

    async fn ensure_with_retry(&self, source: &str, recovery_on_success: bool) -> bool {
        let mut had_failure = false;
        for attempt in 1..=MAX_CREATION_RETRIES {
            if self.ensure_subscription(source).await {
                if recovery_on_success && had_failure {
                    // failures this cycle count as an outage even without
                    // a persisted down state
                    self.mark_subscription_down();
                    self.check_and_send_recovery_alert(source, None).await;
                }
                return true;
            }
            had_failure = true;
            if attempt < MAX_CREATION_RETRIES {
                tracing::warn!(
                    attempt,
                    max = MAX_CREATION_RETRIES,
                    "Subscription creation failed, retrying in {RETRY_DELAY_SECONDS}s"
                );
                tokio::time::sleep(std::time::Duration::from_secs(RETRY_DELAY_SECONDS)).await;
            }
        }
        false
    }

    /// Background loop: startup ensure with retries, then periodic checks
    /// and the daily refresh.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            check_interval_minutes = CHECK_INTERVAL_MINUTES,
            daily_recreate_hour_utc = DAILY_RECREATE_HOUR_UTC,
            "Starting subscription manager"
        );

        // let the relay listener connect first; its validation path must be
        // live before the provider validates a new subscription
        tokio::time::sleep(std::time::Duration::from_secs(STARTUP_DELAY_SECONDS)).await;

        if !self.ensure_with_retry("startup", true).await {
            tracing::error!("Failed to create webhook subscription after retries");
            self.send_alert(
                "Webhook Subscription Failed",
                &format!(
                    "<p>Failed to create the change-notification subscription after \
                     {MAX_CREATION_RETRIES} attempts.</p>\
                     <p><strong>Impact:</strong> real-time meeting notifications are NOT \
                     working. Backfill will cover the gap once the subscription returns.</p>"
                ),
                "startup",
            )
            .await;
        }

        let mut last_daily_recreate: Option<DateTime<Utc>> = None;

        while self.running.load(Ordering::SeqCst) {
            let now = Utc::now();

            if now.hour() == DAILY_RECREATE_HOUR_UTC {
                let due = last_daily_recreate
                    .map_or(true, |last| (now - last) >= Duration::days(1));
                if due {
                    tracing::info!("Daily subscription recreation");
                    if !self.recreate_subscription("daily_refresh").await {
                        self.send_alert(
                            "Daily Webhook Subscription Refresh Failed",
                            "<p>The daily subscription refresh failed. Notifications may \
                             not be delivered until the next check succeeds.</p>",
                            "daily_refresh",
                        )
                        .await;
                    }
                    last_daily_recreate = Some(now);
                }
            } else if !self.ensure_subscription("check").await
                && !self.ensure_with_retry("check", false).await
            {
                self.send_alert(
                    "Webhook Subscription Check Failed",
                    &format!(
                        "<p>Periodic check found no valid subscription and recreation \
                         failed after {MAX_CREATION_RETRIES} attempts.</p>\
                         <p>The next check runs in {CHECK_INTERVAL_MINUTES} minutes.</p>"
                    ),
                    "check",
                )
                .await;
            }

            tokio::time::sleep(std::time::Duration::from_secs(CHECK_INTERVAL_MINUTES * 60)).await;
        }

        tracing::info!("Subscription manager stopped");
    }

    // ========================= events & alerts =========================

    fn log_event(
        &self,
        event_type: SubscriptionEventType,
        source: &str,
        subscription_id: Option<&str>,
        error_message: Option<&str>,
        down_event_id: Option<i64>,
        downtime_seconds: Option<i64>,
    ) -> Option<i64> {
        match self.db.log_subscription_event(
            event_type,
            source,
            subscription_id,
            error_message,
            down_event_id,
            downtime_seconds,
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(error = %e, "Failed to log subscription event");
                None
            }
        }
    }

    /// Mark the subscription down: persist the marker file, append the
    /// `down` event, remember it for recovery pairing. Idempotent while
    /// already down.
    fn record_down(&self, source: &str, error_message: &str) {
        let mut state = self.state.lock().unwrap();
        if state.subscription_down {
            return;
        }
        state.subscription_down = true;
        state.down_timestamp = Some(Utc::now());
        drop(state);

        self.save_down_state(true);
        let event_id = self.log_event(
            SubscriptionEventType::Down,
            source,
            None,
            Some(error_message),
            None,
            None,
        );
        self.state.lock().unwrap().down_event_id = event_id;
    }

    /// If we were down, pair an `up` event with the outstanding `down`,
    /// compute downtime, clear the marker, and send one recovery email.
    async fn check_and_send_recovery_alert(&self, source: &str, subscription_id: Option<&str>) {
        let was_down = {
            let state = self.state.lock().unwrap();
            state.subscription_down
        };
        if !was_down {
            return;
        }

        let now = Utc::now();
        let (down_event_id, down_timestamp) = {
            let state = self.state.lock().unwrap();
            (state.down_event_id, state.down_timestamp)
        };
        // after a restart the in-memory pairing is gone; recover it from
        // the event log
        let (down_event_id, down_timestamp) = match (down_event_id, down_timestamp) {
            (Some(id), Some(ts)) => (Some(id), Some(ts)),
            _ => match self.db.latest_unpaired_down_event() {
                Ok(Some((id, ts))) => (Some(id), Some(ts)),
                _ => (down_event_id, down_timestamp),
            },
        };

        let downtime_seconds = down_timestamp.map(|ts| (now - ts).num_seconds());

        self.log_event(
            SubscriptionEventType::Up,
            source,
            subscription_id,
            None,
            down_event_id,
            downtime_seconds,
        );

        {
            let mut state = self.state.lock().unwrap();
            state.subscription_down = false;
            state.down_event_id = None;
            state.down_timestamp = None;
        }
        self.save_down_state(false);

        tracing::info!(
            downtime = format_downtime(downtime_seconds),
            "Subscription recovered"
        );
        self.send_recovery_email(down_timestamp, now, downtime_seconds)
            .await;
    }

    async fn send_recovery_email(
        &self,
        down_timestamp: Option<DateTime<Utc>>,
        up_timestamp: DateTime<Utc>,
        downtime_seconds: Option<i64>,
    ) {
        let settings = self.config.settings();
        if !settings.alert_email_enabled || settings.alert_email_recipients.is_empty() {
            return;
        }
        let Some(from) = settings.email_from else {
            return;
        };

        let mut details = String::new();
        if let Some(down) = down_timestamp {
            details.push_str(&format!(
                "<strong>Disconnected:</strong> {} UTC<br/>",
                down.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        details.push_str(&format!(
            "<strong>Reconnected:</strong> {} UTC<br/>",
            up_timestamp.format("%Y-%m-%d %H:%M:%S")
        ));
        details.push_str(&format!(
            "<strong>Total Downtime:</strong> {}",
            format_downtime(downtime_seconds)
        ));

        let body = format!(
            "<h2>Webhook Recovered</h2>\
             <p>The change-notification subscription is active again; real-time \
             meeting notifications are flowing.</p>\
             <p>{details}</p>\
             <p style=\"color:#666;font-size:12px\">Webhook URL: {}</p>",
            self.webhook_url
        );

        for recipient in &settings.alert_email_recipients {
            match mail::send_mail(&self.graph, &from, recipient, "[Meeting Scribe] Webhook Recovered", &body).await
            {
                Ok(()) => tracing::info!(recipient, "Recovery alert sent"),
                Err(e) => tracing::error!(recipient, error = %e, "Failed to send recovery alert"),
            }
        }
    }

    /// Failure alert with cooldown; also flips the down state.
    async fn send_alert(&self, subject: &str, body_html: &str, source: &str) {
        self.record_down(source, subject);

        let settings = self.config.settings();
        if !settings.alert_email_enabled || settings.alert_email_recipients.is_empty() {
            tracing::warn!(subject, "Alert not sent (alerting disabled or no recipients)");
            return;
        }
        let Some(from) = settings.email_from else {
            tracing::warn!(subject, "Alert not sent (no sender address configured)");
            return;
        };

        let now = Utc::now();
        {
            let state = self.state.lock().unwrap();
            if let Some(last) = state.last_alert_time {
                if now - last < Duration::hours(ALERT_COOLDOWN_HOURS) {
                    tracing::info!(subject, "Alert suppressed (cooldown)");
                    return;
                }
            }
        }

        let body = format!(
            "<h2>Meeting Scribe Alert</h2>\
             <p><strong>Issue:</strong> {subject}</p>{body_html}\
             <p style=\"color:#666;font-size:12px\">Webhook URL: {}<br/>\
             Time: {} UTC<br/>\
             No further alerts for {ALERT_COOLDOWN_HOURS} hours.</p>",
            self.webhook_url,
            now.format("%Y-%m-%d %H:%M:%S"),
        );

        for recipient in &settings.alert_email_recipients {
            match mail::send_mail(
                &self.graph,
                &from,
                recipient,
                &format!("[Meeting Scribe Alert] {subject}"),
                &body,
            )
            .await
            {
                Ok(()) => tracing::info!(recipient, subject, "Alert sent"),
                Err(e) => tracing::error!(recipient, error = %e, "Failed to send alert"),
            }
        }

        self.state.lock().unwrap().last_alert_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GraphConfig};

    fn make_manager(db: &Database, state_file: PathBuf) -> SubscriptionManager {
        std::env::set_var("GRAPH_TENANT_ID", "t");
        std::env::set_var("GRAPH_CLIENT_ID", "c");
        std::env::set_var("GRAPH_CLIENT_SECRET", "s");
        std::env::set_var("RELAY_NAMESPACE", "example.servicebus.windows.net");
        std::env::set_var("RELAY_KEY", "k");
        let config = Arc::new(Config::from_env().unwrap());
        let graph = GraphClient::new(GraphConfig {
            tenant_id: "t".to_string(),
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
        })
        .unwrap();
        SubscriptionManager::new(db.clone(), graph, config).with_state_file(state_file)
    }

    #[test]
    fn test_matching_subscriptions_filters() {
        let listing = serde_json::json!({
            "value": [
                {
                    "id": "sub-1",
                    "resource": "/communications/callRecords",
                    "notificationUrl": "https://example.servicebus.windows.net/webhooks",
                    "expirationDateTime": "2026-08-03T00:00:00Z"
                },
                {
                    "id": "sub-2",
                    "resource": "/communications/callRecords",
                    "notificationUrl": "https://other.example.com/hook",
                },
                {
                    "id": "sub-3",
                    "resource": "/teams/getAllMessages",
                    "notificationUrl": "https://example.servicebus.windows.net/webhooks",
                }
            ]
        });

        let matches = matching_subscriptions(
            &listing,
            "/communications/callRecords",
            "https://example.servicebus.windows.net/webhooks",
        );
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "sub-1");
        assert!(matches[0].expiration.is_some());
    }

    #[test]
    fn test_needs_renewal_window() {
        let now = Utc::now();
        assert!(!needs_renewal(Some(now + Duration::hours(48)), now));
        assert!(needs_renewal(Some(now + Duration::hours(11)), now));
        assert!(needs_renewal(Some(now - Duration::hours(1)), now));
        // unparseable expiry treats the subscription as expiring
        assert!(needs_renewal(None, now));
    }

    #[test]
    fn test_format_downtime() {
        assert_eq!(format_downtime(None), "Unknown");
        assert_eq!(format_downtime(Some(45)), "45 seconds");
        assert_eq!(format_downtime(Some(150)), "2m 30s");
        assert_eq!(format_downtime(Some(10_800)), "3h 0m");
        assert_eq!(format_downtime(Some(3_725)), "1h 2m");
    }

    #[test]
    fn test_down_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state");
        let db = Database::open_in_memory().unwrap();
        let manager = make_manager(&db, state_file.clone());

        assert!(!manager.load_down_state());
        manager.save_down_state(true);
        assert!(manager.load_down_state());
        assert_eq!(std::fs::read_to_string(&state_file).unwrap(), "down");

        manager.save_down_state(false);
        assert!(!manager.load_down_state());
        assert!(!state_file.exists());
        // clearing twice is fine
        manager.save_down_state(false);
    }

    #[test]
    fn test_record_down_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let manager = make_manager(&db, dir.path().join("state"));

        manager.record_down("check", "creation failed");
        manager.record_down("check", "creation failed again");

        // only one down event despite two calls
        let (down_id, _) = db.latest_unpaired_down_event().unwrap().unwrap();
        let conn = db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM subscription_events WHERE event_type = 'down'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(down_id > 0);
    }

    #[tokio::test]
    async fn test_down_up_pairing_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state");
        let db = Database::open_in_memory().unwrap();

        // first process: goes down
        let manager = make_manager(&db, state_file.clone());
        manager.record_down("startup", "creation failed");
        assert!(state_file.exists());
        let (down_id, _) = db.latest_unpaired_down_event().unwrap().unwrap();

        // second process: loads the persisted state, recovers
        let restarted = make_manager(&db, state_file.clone());
        assert!(restarted.state.lock().unwrap().subscription_down);

        restarted
            .check_and_send_recovery_alert("startup", Some("sub-9"))
            .await;

        // up event paired with the original down event
        {
            let conn = db.lock();
            let (paired, downtime): (Option<i64>, Option<i64>) = conn
                .query_row(
                    "SELECT down_event_id, downtime_seconds FROM subscription_events
                     WHERE event_type = 'up'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap();
            assert_eq!(paired, Some(down_id));
            assert!(downtime.is_some());
        }

        // state cleared: no second recovery alert
        assert!(!state_file.exists());
        assert!(db.latest_unpaired_down_event().unwrap().is_none());
        restarted
            .check_and_send_recovery_alert("check", Some("sub-9"))
            .await;
        let conn = db.lock();
        let up_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM subscription_events WHERE event_type = 'up'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(up_count, 1);
    }
}
