//! On-disk layout of a HoloStore store.
//!
//! This crate describes how a store persists its data: the raw key layout,
//! the checksummed value envelope, MVCC versioning, and the per-range raft
//! and stats metadata. Offline tools read and rewrite stores through the
//! narrow [`engine::Reader`] / [`engine::Engine`] capability, backed either by
//! fjall on disk or by an in-memory map in tests.

pub mod encoding;
pub mod engine;
pub mod error;
pub mod fjall_engine;
pub mod hlc;
pub mod keys;
pub mod mvcc;
pub mod records;
pub mod state;
pub mod stats;
pub mod value;

#[cfg(any(test, feature = "test-support"))]
pub mod fixture;

pub use engine::{Batch, Engine, MemEngine, MvccKey, MvccKeyValue, Reader, Writer};
pub use error::{DecodeError, MvccError};
pub use fjall_engine::{FjallEngine, OpenOptions};
pub use hlc::{HlcClock, Timestamp};
pub use value::Value;
