//! ComfyUI gateway, push-channel listener and generation job tracker.
//!
//! [`api::ComfyUIApi`] wraps the HTTP routes, [`client::ComfyUIClient`]
//! opens the WebSocket push channel and [`listener`] turns its frames
//! into typed [`events::BackendEvent`]s. [`tracker::JobTracker`] ties
//! them together: it submits graphs built by `kiln-core`, correlates
//! push events back to jobs through the [`store::JobStore`] and collects
//! the produced artifacts.

pub mod api;
pub mod backend;
pub mod backoff;
pub mod capability;
pub mod client;
pub mod config;
pub mod events;
pub mod history;
pub mod listener;
pub mod messages;
pub mod store;
pub mod tracker;
