//! Fallback discovery
//!
//! Calendar polling path used when webhook delivery is unavailable.

pub mod filters;
pub mod poller;
