//! Hash-chain integrity verification.
//!
//! [`verify`] walks every control's chain from its first record,
//! recomputing each record's content hash from the stored bytes and
//! checking the link to its predecessor. Verification never mutates the
//! ledger: a detected break is reported, not repaired, and re-running on
//! an unmodified ledger returns an identical report.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::crypto::sha256_hex;
use crate::evidence::GENESIS_PREV_HASH;

use super::storage::{Ledger, LedgerError};

/// The kind of chain break found at a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// A record's stored content no longer matches its stored hash
    /// (the record, or its raw artifact, was altered).
    HashMismatch,
    /// A record's `previous_hash` doesn't match its predecessor's
    /// recomputed hash (deletion, reordering, or insertion).
    BrokenLink,
}

impl std::fmt::Display for BreakKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HashMismatch => f.write_str("hash mismatch"),
            Self::BrokenLink => f.write_str("broken link"),
        }
    }
}

/// An integrity break at a specific position in a control's chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainBreak {
    /// Zero-based position of the offending record in chain order. A
    /// break at `position == chain length` means the chain-head index no
    /// longer matches the final record (tail truncation).
    pub position: usize,
    /// Evidence ID at the break, when a record exists there.
    pub evidence_id: Option<String>,
    /// What kind of break.
    pub kind: BreakKind,
    /// Human-readable description of the mismatch.
    pub detail: String,
}

/// Chain verification outcome for one control.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChainStatus {
    /// Every hash and link checked out.
    Intact {
        /// Number of records in the chain.
        length: usize,
    },
    /// The chain is broken; only the first break is reported.
    Broken {
        /// Number of records examined.
        length: usize,
        /// The first break found.
        fault: ChainBreak,
    },
}

impl ChainStatus {
    /// Whether the chain verified clean.
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        matches!(self, Self::Intact { .. })
    }
}

/// Verification report: chain status per control.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// Status per control, sorted by control ID.
    pub chains: BTreeMap<String, ChainStatus>,
}

impl VerifyReport {
    /// Whether every control's chain is intact.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.chains.values().all(ChainStatus::is_intact)
    }

    /// Controls whose chains are broken, sorted.
    #[must_use]
    pub fn broken(&self) -> Vec<(&str, &ChainBreak)> {
        self.chains
            .iter()
            .filter_map(|(control, status)| match status {
                ChainStatus::Intact { .. } => None,
                ChainStatus::Broken { fault, .. } => Some((control.as_str(), fault)),
            })
            .collect()
    }
}

impl Ledger {
    /// Walks every control's hash chain and reports its status.
    ///
    /// Detects single-byte mutation of a stored record, record deletion,
    /// reordering, and insertion, and tampering with a raw artifact file.
    /// Side-effect-free and deterministic.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage-level failures; integrity
    /// violations are reported in the [`VerifyReport`], never as errors.
    pub fn verify(&self) -> Result<VerifyReport, LedgerError> {
        let mut chains = BTreeMap::new();
        for control_id in self.chain_controls()? {
            let status = self.verify_control(&control_id)?;
            if let ChainStatus::Broken { fault, .. } = &status {
                warn!(
                    control_id = %control_id,
                    position = fault.position,
                    kind = %fault.kind,
                    "chain break detected"
                );
            }
            chains.insert(control_id, status);
        }
        info!(
            controls = chains.len(),
            intact = chains.values().filter(|s| s.is_intact()).count(),
            "integrity verification complete"
        );
        Ok(VerifyReport { chains })
    }

    fn verify_control(&self, control_id: &str) -> Result<ChainStatus, LedgerError> {
        let rows = self.stored_chain(control_id)?;
        let length = rows.len();
        let mut expected_prev = GENESIS_PREV_HASH.to_string();

        for (position, row) in rows.iter().enumerate() {
            // Link check first: a bad link points at deletion, reordering,
            // or insertion at this position.
            if row.previous_hash != expected_prev {
                return Ok(ChainStatus::Broken {
                    length,
                    fault: ChainBreak {
                        position,
                        evidence_id: Some(row.evidence_id.clone()),
                        kind: BreakKind::BrokenLink,
                        detail: format!(
                            "previous_hash {} does not match expected {}",
                            shorten(&row.previous_hash),
                            shorten(&expected_prev),
                        ),
                    },
                });
            }

            // Content check: recompute the canonical hash from stored bytes.
            let recomputed = match row.recompute_hash() {
                Ok(hash) => hash,
                Err(LedgerError::Corrupt { detail, .. }) => {
                    return Ok(ChainStatus::Broken {
                        length,
                        fault: ChainBreak {
                            position,
                            evidence_id: Some(row.evidence_id.clone()),
                            kind: BreakKind::HashMismatch,
                            detail,
                        },
                    });
                }
                Err(other) => return Err(other),
            };
            if recomputed != row.content_hash {
                return Ok(ChainStatus::Broken {
                    length,
                    fault: ChainBreak {
                        position,
                        evidence_id: Some(row.evidence_id.clone()),
                        kind: BreakKind::HashMismatch,
                        detail: format!(
                            "stored hash {} but content hashes to {}",
                            shorten(&row.content_hash),
                            shorten(&recomputed),
                        ),
                    },
                });
            }

            // Raw artifact check, when one was stored.
            if let Some(fault) = self.check_artifact(position, row)? {
                return Ok(ChainStatus::Broken { length, fault });
            }

            expected_prev = recomputed;
        }

        // Tail check: the chain-head index must point at the final record,
        // otherwise records were truncated from the end.
        let head = self.chain_head(control_id)?;
        if head.as_deref() != Some(expected_prev.as_str())
            && !(head.is_none() && rows.is_empty())
        {
            return Ok(ChainStatus::Broken {
                length,
                fault: ChainBreak {
                    position: length,
                    evidence_id: None,
                    kind: BreakKind::BrokenLink,
                    detail: format!(
                        "chain head index {} does not match final record {}",
                        shorten(head.as_deref().unwrap_or(GENESIS_PREV_HASH)),
                        shorten(&expected_prev),
                    ),
                },
            });
        }

        Ok(ChainStatus::Intact { length })
    }

    fn check_artifact(
        &self,
        position: usize,
        row: &super::storage::StoredRow,
    ) -> Result<Option<ChainBreak>, LedgerError> {
        let (Some(path), Some(expected)) = (&row.raw_data_path, &row.raw_data_sha256) else {
            return Ok(None);
        };
        let full = self.evidence_dir().join(path);
        let bytes = match std::fs::read(&full) {
            Ok(bytes) => bytes,
            Err(_) => {
                return Ok(Some(ChainBreak {
                    position,
                    evidence_id: Some(row.evidence_id.clone()),
                    kind: BreakKind::HashMismatch,
                    detail: format!("raw artifact missing at {path}"),
                }));
            }
        };
        let actual = sha256_hex(&bytes);
        if actual != *expected {
            return Ok(Some(ChainBreak {
                position,
                evidence_id: Some(row.evidence_id.clone()),
                kind: BreakKind::HashMismatch,
                detail: format!(
                    "raw artifact digest {} does not match recorded {}",
                    shorten(&actual),
                    shorten(expected),
                ),
            }));
        }
        Ok(None)
    }
}

/// Truncates a hex digest for error messages.
fn shorten(hash: &str) -> String {
    if hash.is_empty() {
        "<genesis>".to_string()
    } else if hash.len() > 16 {
        format!("{}…", &hash[..16])
    } else {
        hash.to_string()
    }
}
