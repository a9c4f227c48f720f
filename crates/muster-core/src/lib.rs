//! Foundational low-level utilities shared across Muster crates.
//!
//! Provides atomic file-write helpers, unix-time utilities, size-based JSONL
//! rotation used by the interaction journal, and the tracing bootstrap for
//! host applications.

pub mod atomic_io;
pub mod jsonl_rotation;
pub mod logging;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use logging::init_tracing;
pub use jsonl_rotation::{append_jsonl_with_rotation, JsonlRotationPolicy};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_older_than_unix};
