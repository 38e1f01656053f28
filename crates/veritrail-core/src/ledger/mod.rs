//! Append-only evidence ledger.
//!
//! The ledger stores evidence records in SQLite (WAL mode) with a
//! per-control cryptographic hash chain. Each append computes the record's
//! `previous_hash` from the latest record of the same control, hashes the
//! record's canonical form, and persists row plus chain-head index in a
//! single transaction — a record is either fully appended or not appended
//! at all.
//!
//! Records are never modified or deleted: a correction is a new record.
//! [`verify`](integrity::verify) walks every control's chain and reports
//! the exact position and kind of any break.
//!
//! # Example
//!
//! ```rust,no_run
//! use veritrail_core::evidence::{EvidenceRecord, EvidenceType};
//! use veritrail_core::ledger::Ledger;
//!
//! # fn example() -> Result<(), veritrail_core::ledger::LedgerError> {
//! let ledger = Ledger::open("/var/lib/veritrail/evidence.db", "/var/lib/veritrail/evidence")?;
//!
//! let record = EvidenceRecord::new(
//!     "A.5.17",
//!     "Authentication information",
//!     "mfa_enrollment",
//!     "directory_platform",
//!     EvidenceType::Snapshot,
//! );
//! let frozen = ledger.append(record)?;
//! assert!(!frozen.content_hash.is_empty());
//! # Ok(())
//! # }
//! ```

mod integrity;
mod storage;

#[cfg(test)]
mod tests;

pub use integrity::{BreakKind, ChainBreak, ChainStatus, VerifyReport};
pub use storage::{Ledger, LedgerError, LedgerStats};
