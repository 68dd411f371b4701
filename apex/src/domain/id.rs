//! Opaque identifier generation shared by every record kind.

use uuid::Uuid;

/// Generates a fresh unique id for a new record.
///
/// Callers never parse or structure this value; it is opaque per the data
/// model. A v4 UUID string keeps collisions astronomically unlikely across
/// restarts without needing a central counter.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
