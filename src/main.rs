//! Meeting Scribe - Teams meeting transcript summarizer
//!
//! Event-driven ingestion of meeting notifications, a dependency-aware job
//! queue, and distribution of AI-generated summaries to opted-in
//! participants.

mod cli;
mod config;
mod db;
mod discovery;
mod graph;
mod jobs;
mod prefs;
mod summarizer;
mod vtt;
mod webhooks;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meeting_scribe=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let code = cli::run().await;
    std::process::exit(code);
}
