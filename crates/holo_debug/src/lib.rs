//! Offline diagnostics and repair for HoloStore stores.
//!
//! Everything here runs against a stopped node's store directory: decoding
//! raw entries for humans, checking raft and MVCC stats invariants, and the
//! last-resort rewrite that lets a range with a lost quorum recover on the
//! surviving replica.

pub mod check_store;
pub mod decode;
pub mod dump;
pub mod raft_check;
pub mod recovery;
pub mod report;
pub mod stats_check;

pub use check_store::{check_store, CheckStoreConfig};
pub use decode::{decode, decode_first, Interpreter, Outcome, Record};
pub use raft_check::{check_raft_state, RaftAnomaly, ReplicaCheckInfo};
pub use recovery::{remove_dead_replicas, RecoveryConfig, RecoveryError, RecoveryOutcome};
pub use stats_check::{check_mvcc_stats, StatsMismatch};
