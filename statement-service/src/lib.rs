//! Financial statement retrieval and delivery pipeline.
//!
//! Polls a banking data aggregator for newly available statements,
//! learns when each account's statement typically appears, and streams
//! new statements to the user's cloud storage destinations, notifying
//! subscribers over signed webhooks.

pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod services;
pub mod startup;
pub mod webhook;

pub use startup::{AppState, Application};
