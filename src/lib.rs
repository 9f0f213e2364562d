//! Offline-resilient request interception for local-first apps.
//!
//! Requests are classified, answered from tiered caches or the network
//! according to their category, and writes that cannot be delivered are
//! queued durably until connectivity returns.

pub mod app;
pub mod cache;
pub mod classify;
pub mod config;
pub mod control;
pub mod db;
pub mod event;
pub mod fetch;
pub mod governor;
pub mod integrity;
pub mod interceptor;
pub mod metrics;
pub mod network;
pub mod queue;
pub mod request;
