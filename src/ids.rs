//! Identities for clients, tasks, and requests.

use std::fmt;
use uuid::Uuid;

/// Opaque identifier for a `Streamer` instance, unique per process.
///
/// Generated once at construction (see [`crate::streamer::Streamer::new`])
/// and attached to every request item that `Streamer` emits, so a
/// broker-backed worker's responses can be routed back to the right process
/// over a per-client pub/sub channel. The in-memory transport ignores it —
/// there is exactly one client in that configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh, random client id.
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }

    /// Canonical textual form, e.g. for building the broker's
    /// `response_pb_<client_id>` channel name.
    pub fn as_canonical(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic, non-negative task identifier, unique within a `Streamer`.
///
/// Assigned at `submit` time from an internal counter; two concurrent
/// submissions from the same `Streamer` always receive distinct values.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-negative request identifier, unique within a task, assigned in input
/// order starting at 0.
///
/// This is what lets a `Future` restore the caller's original ordering
/// regardless of the order responses actually arrive in.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct RequestId(pub usize);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
