//! Local identifier generation.
//!
//! Identifiers are UUIDv7 so that they sort by creation time, which keeps
//! primary-key inserts append-mostly.

use uuid::Uuid;

pub fn new_id() -> Uuid {
    Uuid::now_v7()
}
