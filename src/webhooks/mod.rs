//! Webhook ingestion
//!
//! Real-time path: subscription manager keeps the provider pointed at the
//! relay, the relay listener accepts forwarded requests, the handler turns
//! notifications into meetings and jobs, and backfill covers any gap.

pub mod backfill;
pub mod handler;
pub mod relay;
pub mod subscriptions;
