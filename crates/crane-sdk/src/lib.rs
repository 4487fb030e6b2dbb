//! Shared building blocks for the crane control broker: the coordination
//! store contract, an in-memory store, the binary control-frame codec and
//! the status vocabulary pushed to operators.

pub mod frame;
pub mod memory;
pub mod protocol;
pub mod store;

/// Milliseconds since the Unix epoch, the timestamp unit used by every record.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
