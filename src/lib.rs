//! Entity caching and remote-account dereferencing for a federated social server.
//!
//! The crate is layered the same way throughout:
//!
//! - [`cache`]: capacity planning, keyed locks and the multi-index entity cache.
//! - [`domain`]: plain entity records and their error type.
//! - [`application`]: cached repositories and the dereferencing state machine.
//! - [`infra`]: Postgres and in-memory stores, HTTP transport, media storage, telemetry.
//! - [`config`]: layered settings (file, environment, CLI).

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
