//! Admission control and resilience core for a chat-command bot.
//!
//! Transports and upstream services (LLM, document storage, cache backends)
//! live behind ports (traits); this crate owns the checks and policies around them.

pub mod access;
pub mod actions;
pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gatekeeper;
pub mod logging;
pub mod ports;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod validation;

pub use errors::{Error, Result};
