//! Infrastructure adapters and runtime bootstrap.

pub mod convert;
pub mod db;
pub mod error;
pub mod media;
pub mod memory;
pub mod telemetry;
pub mod transport;
pub mod webfinger;
