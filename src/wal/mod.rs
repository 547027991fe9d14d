//! Write-Ahead Log Module
//!
//! Segmented, append-only log of mutations. The WAL is the source of
//! truth for replay after a restart and for bringing followers up to
//! date by LSN.

pub mod record;
mod segment;
mod log;

pub use log::Wal;
pub use record::{validate_key, Lsn, WalOp, WalRecord};
pub use segment::list_segments;
