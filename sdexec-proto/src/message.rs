//! Message types exchanged by the pipeline.

use serde::{Deserialize, Serialize};

/// Largest datagram the manager is expected to receive (unit names are
/// bounded at 256 bytes, plus two ids).
pub const MAX_DATAGRAM: usize = 512;

/// Identity resolved for one execution attempt, sent to the manager exactly
/// once, after resolution and before privileges are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityReport {
    /// Resolved user id.
    pub uid: u32,
    /// Resolved primary group id.
    pub gid: u32,
    /// Unit the attempt belongs to.
    pub unit_id: String,
}

/// Failure reported by a helper process over its result channel.
///
/// A helper that succeeds writes nothing; the channel is closed on exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperError {
    /// Operation that failed (e.g. `"write uid_map"`).
    pub op: String,
    /// Raw OS error number.
    pub errno: i32,
}

impl HelperError {
    /// Creates a new helper error record.
    pub fn new(op: impl Into<String>, errno: i32) -> Self {
        Self {
            op: op.into(),
            errno,
        }
    }
}
