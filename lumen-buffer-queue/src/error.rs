//! Error types for the buffer queue protocol.

use thiserror::Error;

use crate::fence::FenceError;

/// Errors surfaced by the buffer queue protocol and the `Surface` client.
///
/// The variants follow a fixed taxonomy: protocol violations are caller
/// bugs and are never retried internally; resource exhaustion is distinct
/// from bad arguments so callers can apply their own backoff policy;
/// synchronization failures are propagated, never swallowed.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A call arrived out of sequence: double lock, unlock without a lock,
    /// queueing a slot that was never dequeued, connecting twice.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// An argument failed validation (negative or partially-specified
    /// dimensions, out-of-range slot index, mismatched api).
    #[error("bad value: {0}")]
    BadValue(&'static str),

    /// All buffer slots are currently owned; the caller may retry after
    /// the consumer releases a buffer.
    #[error("no free buffer slot available")]
    OutOfBuffers,

    /// The allocator driver could not produce a buffer.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// A fence wait failed. Proceeding would risk touching memory still in
    /// use by the other side, so this is always propagated.
    #[error("fence error")]
    Fence(#[from] FenceError),
}
