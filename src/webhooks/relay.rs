//! Relay listener
//!
//! Maintains one WebSocket control channel to the cloud relay and answers
//! the HTTP-over-the-channel requests it forwards. Validation handshakes
//! are the latency-critical path: they must be answered with the bare
//! token within seconds or the provider refuses the subscription.

use crate::config::RelayConfig;
use crate::webhooks::handler::NotificationHandler;
use base64::Engine;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;

/// Delay before re-establishing a dropped control channel.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long to wait for the binary frame announced by a `body: true`
/// sentinel.
const BODY_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

const SAS_TOKEN_LIFETIME_SECONDS: i64 = 3600;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Relay protocol error: {0}")]
    Protocol(String),
}

/// One forwarded HTTP request, decoded from the control-channel envelope.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: BodySpec,
    /// Rendezvous address when the response must go over its own channel.
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySpec {
    /// Body arrived inline in the envelope.
    Inline(String),
    /// Body follows as a binary frame.
    Follows,
    Empty,
}

/// Decode a control-channel envelope.
pub fn parse_envelope(text: &str) -> Option<RelayRequest> {
    let envelope: Value = serde_json::from_str(text).ok()?;
    let request = envelope.get("request")?;

    let target = request
        .get("requestTarget")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };

    let body = match request.get("body") {
        Some(Value::String(s)) => BodySpec::Inline(s.clone()),
        Some(Value::Bool(true)) => BodySpec::Follows,
        _ => BodySpec::Empty,
    };

    Some(RelayRequest {
        id: request
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        method: request
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        path,
        query,
        body,
        address: request
            .get("address")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

/// Pull a validation token out of a query string.
pub fn validation_token(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "validationToken")
        .map(|(_, value)| value.into_owned())
}

/// Response frame per the relay protocol: status code as a string,
/// `responseHeaders`, and a `body` flag announcing a binary frame.
pub fn response_frame(request_id: &str, status: u16, content_type: &str, has_body: bool) -> String {
    json!({
        "response": {
            "requestId": request_id,
            "statusCode": status.to_string(),
            "statusDescription": if status == 200 { "OK" } else { "Error" },
            "responseHeaders": { "Content-Type": content_type },
            "body": has_body,
        }
    })
    .to_string()
}

fn build_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn url_encode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                char::from(b).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

/// Shared-access-signature token over the hybrid connection URI.
pub fn sas_token(resource_uri: &str, key_name: &str, key: &str, expiry_unix: i64) -> String {
    let encoded_uri = url_encode(resource_uri);
    let to_sign = format!("{encoded_uri}\n{expiry_unix}");

    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry_unix}&skn={key_name}",
        url_encode(&signature)
    )
}

pub struct RelayListener {
    config: RelayConfig,
    handler: NotificationHandler,
    running: Arc<AtomicBool>,
    /// One TLS client config shared by the control channel and every
    /// rendezvous connect. Its session cache resumes repeat handshakes,
    /// so answering a validation never pays a cold TLS setup.
    tls: Arc<rustls::ClientConfig>,
}

impl RelayListener {
    pub fn new(config: RelayConfig, handler: NotificationHandler) -> Self {
        Self {
            config,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            tls: build_tls_config(),
        }
    }

    fn connector(&self) -> Connector {
        Connector::Rustls(self.tls.clone())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn listen_url(&self) -> String {
        let resource_uri = format!(
            "http://{}/{}",
            self.config.namespace, self.config.connection_name
        );
        let expiry = Utc::now().timestamp() + SAS_TOKEN_LIFETIME_SECONDS;
        let token = sas_token(&resource_uri, &self.config.key_name, &self.config.key, expiry);

        format!(
            "wss://{}/$hc/{}?sb-hc-action=listen&sb-hc-id=listener-{}&sb-hc-token={}",
            self.config.namespace,
            self.config.connection_name,
            uuid::Uuid::new_v4().simple(),
            url_encode(&token)
        )
    }

    /// Connect and serve until stopped. Any channel error backs off and
    /// reconnects; the listener owns exactly one control channel at a time.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            namespace = self.config.namespace,
            connection = self.config.connection_name,
            "Starting relay listener"
        );

        while self.running.load(Ordering::SeqCst) {
            let url = self.listen_url();
            match tokio_tungstenite::connect_async_tls_with_config(
                url.as_str(),
                None,
                false,
                Some(self.connector()),
            )
            .await
            {
                Ok((mut stream, _)) => {
                    tracing::info!("✓ Connected to relay");
                    if let Err(e) = self.serve(&mut stream).await {
                        tracing::error!(error = %e, "Relay channel error");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Relay connection failed");
                }
            }

            if self.running.load(Ordering::SeqCst) {
                tracing::info!("Reconnecting in {}s", RECONNECT_DELAY.as_secs());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }

        tracing::info!("Relay listener stopped");
    }

    async fn serve<S>(
        &self,
        stream: &mut tokio_tungstenite::WebSocketStream<S>,
    ) -> Result<(), RelayError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        while self.running.load(Ordering::SeqCst) {
            let Some(message) = stream.next().await else {
                return Err(RelayError::Protocol("channel closed".to_string()));
            };
            match message? {
                Message::Text(text) => self.handle_control_message(&text, stream).await?,
                Message::Ping(payload) => stream.send(Message::Pong(payload)).await?,
                Message::Close(_) => {
                    return Err(RelayError::Protocol("relay closed channel".to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_control_message<S>(
        &self,
        text: &str,
        stream: &mut tokio_tungstenite::WebSocketStream<S>,
    ) -> Result<(), RelayError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let Some(request) = parse_envelope(text) else {
            tracing::warn!("Unparseable relay frame");
            return Ok(());
        };
        tracing::debug!(
            method = request.method,
            path = request.path,
            request_id = request.id,
            "Relay request"
        );

        // Fast path: validation handshake. Must answer with the bare token.
        if let Some(token) = validation_token(&request.query) {
            let started = std::time::Instant::now();
            tracing::info!(request_id = request.id, "Validation request received");

            if let Some(address) = request
                .address
                .as_deref()
                .filter(|a| a.contains("sb-hc-action=request"))
            {
                self.send_rendezvous_response(address, &request.id, &token)
                    .await;
            } else {
                stream
                    .send(Message::Text(response_frame(
                        &request.id,
                        200,
                        "text/plain; charset=utf-8",
                        true,
                    )))
                    .await?;
                stream
                    .send(Message::Binary(token.clone().into_bytes()))
                    .await?;
            }
            tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "✓ Validation answered"
            );
            return Ok(());
        }

        // Resolve the body: inline, follow-up binary frame, or empty.
        let notification: Value = match &request.body {
            BodySpec::Inline(body) => {
                if let Some(token) = body.strip_prefix("validationToken=") {
                    json!({ "validationToken": token })
                } else {
                    serde_json::from_str(body).unwrap_or_else(|_| json!({ "raw": body }))
                }
            }
            BodySpec::Follows => {
                match tokio::time::timeout(BODY_FRAME_TIMEOUT, stream.next()).await {
                    Ok(Some(Ok(Message::Binary(bytes)))) => {
                        let body = String::from_utf8_lossy(&bytes).into_owned();
                        serde_json::from_str(&body).unwrap_or_else(|_| json!({ "raw": body }))
                    }
                    Ok(Some(Ok(other))) => {
                        tracing::warn!(?other, "Expected binary body frame");
                        json!({})
                    }
                    Ok(Some(Err(e))) => return Err(e.into()),
                    Ok(None) => {
                        return Err(RelayError::Protocol(
                            "channel closed awaiting body".to_string(),
                        ))
                    }
                    Err(_) => {
                        tracing::warn!("Timeout waiting for body frame");
                        json!({})
                    }
                }
            }
            BodySpec::Empty => json!({}),
        };

        // Legacy validation shape: token inside the body
        if let Some(token) = notification.get("validationToken").and_then(|v| v.as_str()) {
            tracing::info!("Responding to body validation request");
            let body = json!({ "validationToken": token }).to_string();
            self.send_json_response(stream, &request.id, 200, &body)
                .await?;
            return Ok(());
        }

        let result = self.handler.handle_notification(&notification).await;
        let status = if result.get("status").and_then(|v| v.as_str()) == Some("error") {
            500
        } else {
            200
        };
        self.send_json_response(stream, &request.id, status, &result.to_string())
            .await
    }

    async fn send_json_response<S>(
        &self,
        stream: &mut tokio_tungstenite::WebSocketStream<S>,
        request_id: &str,
        status: u16,
        body: &str,
    ) -> Result<(), RelayError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let has_body = !body.is_empty();
        stream
            .send(Message::Text(response_frame(
                request_id,
                status,
                "application/json",
                has_body,
            )))
            .await?;
        if has_body {
            stream
                .send(Message::Binary(body.as_bytes().to_vec()))
                .await?;
        }
        Ok(())
    }

    /// Answer on an ephemeral rendezvous channel: the relay requires the
    /// response for a forwarded request to arrive over the address it
    /// supplied, not the control channel.
    async fn send_rendezvous_response(&self, address: &str, request_id: &str, token: &str) {
        let started = std::time::Instant::now();
        match tokio_tungstenite::connect_async_tls_with_config(
            address,
            None,
            false,
            Some(self.connector()),
        )
        .await
        {
            Ok((mut rendezvous, _)) => {
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Rendezvous channel connected"
                );
                let frames = async {
                    rendezvous
                        .send(Message::Text(response_frame(
                            request_id,
                            200,
                            "text/plain",
                            true,
                        )))
                        .await?;
                    rendezvous
                        .send(Message::Binary(token.as_bytes().to_vec()))
                        .await?;
                    rendezvous.close(None).await
                };
                if let Err(e) = frames.await {
                    tracing::error!(error = %e, "Rendezvous response failed");
                } else {
                    tracing::info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        token_bytes = token.len(),
                        "Validation response sent via rendezvous"
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Rendezvous connect failed");
            }
        }
    }
}
