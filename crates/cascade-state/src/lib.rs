//! Cross-process state for backup-cascade
//!
//! Everything that more than one process can observe lives here:
//! - atomic write-replace of small files (the only mutation primitive)
//! - per-stage advisory leases, released by the OS when the holder exits
//! - the handoff store (monotonic sequence + presence-based ready flag)
//! - consumer cursors tracking the last processed handoff sequence

pub mod atomic;
pub mod cursor;
pub mod handoff;
pub mod lease;

pub use atomic::{atomic_write, touch_atomic, AtomicWriteError};
pub use cursor::{CursorError, HandoffCursor};
pub use handoff::{HandoffStore, HandoffToken, StoreError, READY_FILENAME, SEQUENCE_FILENAME};
pub use lease::{Lease, LeaseError, LeaseResult};
