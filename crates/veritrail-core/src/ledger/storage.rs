//! SQLite-backed ledger storage.

// SQLite returns i64 for sequence numbers and counts; they are always
// non-negative here.
#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canonical::CanonicalError;
use crate::crypto::sha256_hex;
use crate::evidence::{
    CanonicalEvidence, ComplianceStatus, EvidenceRecord, EvidenceType, Finding, GENESIS_PREV_HASH,
    Severity, Summary,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while touching the evidence directory.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path involved.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Canonical serialization failed while hashing a record.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// A stored row could not be interpreted as a record.
    #[error("corrupt record {evidence_id}: {detail}")]
    Corrupt {
        /// Identifier of the offending record.
        evidence_id: String,
        /// What failed to parse.
        detail: String,
    },

    /// An internal lock was poisoned by a panicking thread.
    #[error("ledger lock poisoned")]
    LockPoisoned,
}

/// Statistics about the ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    /// Total number of evidence records.
    pub record_count: u64,
    /// Number of distinct controls with at least one record.
    pub control_count: u64,
    /// Highest sequence number (0 if empty).
    pub max_seq: u64,
}

/// A stored row, kept in its persisted string form.
///
/// Integrity verification recomputes hashes from these exact strings so
/// that no parse/re-serialize cycle can mask a stored-byte difference.
#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    pub seq: u64,
    pub evidence_id: String,
    pub control_id: String,
    pub control_name: String,
    pub task_id: String,
    pub collected_at: String,
    pub source: String,
    pub collector_version: String,
    pub evidence_type: String,
    pub record_version: u32,
    pub summary: String,
    pub status: String,
    pub severity: String,
    pub note: String,
    pub raw_data_path: Option<String>,
    pub raw_data_sha256: Option<String>,
    pub content_hash: String,
    pub previous_hash: String,
}

impl StoredRow {
    /// Recomputes the record's canonical hash from the stored fields.
    pub(crate) fn recompute_hash(&self) -> Result<String, LedgerError> {
        let summary: Summary =
            serde_json::from_str(&self.summary).map_err(|e| LedgerError::Corrupt {
                evidence_id: self.evidence_id.clone(),
                detail: format!("unparsable summary: {e}"),
            })?;
        let evidence_type: EvidenceType = serde_json::from_value(serde_json::Value::String(
            self.evidence_type.clone(),
        ))
        .map_err(|e| LedgerError::Corrupt {
            evidence_id: self.evidence_id.clone(),
            detail: format!("unknown evidence type: {e}"),
        })?;
        let finding = self.finding()?;

        let canonical = CanonicalEvidence {
            evidence_id: &self.evidence_id,
            control_id: &self.control_id,
            control_name: &self.control_name,
            task_id: &self.task_id,
            collected_at: &self.collected_at,
            source: &self.source,
            collector_version: &self.collector_version,
            evidence_type,
            record_version: self.record_version,
            summary: &summary,
            finding: &finding,
            raw_data_sha256: self.raw_data_sha256.as_deref(),
        };
        Ok(sha256_hex(&canonical.to_bytes()?))
    }

    fn finding(&self) -> Result<Finding, LedgerError> {
        let status: ComplianceStatus =
            self.status.parse().map_err(|detail| LedgerError::Corrupt {
                evidence_id: self.evidence_id.clone(),
                detail,
            })?;
        let severity: Severity =
            self.severity.parse().map_err(|detail| LedgerError::Corrupt {
                evidence_id: self.evidence_id.clone(),
                detail,
            })?;
        Ok(Finding {
            status,
            severity,
            note: self.note.clone(),
        })
    }

    fn into_record(self) -> Result<EvidenceRecord, LedgerError> {
        let finding = self.finding()?;
        let collected_at: DateTime<Utc> =
            self.collected_at
                .parse()
                .map_err(|e| LedgerError::Corrupt {
                    evidence_id: self.evidence_id.clone(),
                    detail: format!("unparsable timestamp: {e}"),
                })?;
        let summary: Summary =
            serde_json::from_str(&self.summary).map_err(|e| LedgerError::Corrupt {
                evidence_id: self.evidence_id.clone(),
                detail: format!("unparsable summary: {e}"),
            })?;
        let evidence_type: EvidenceType = serde_json::from_value(serde_json::Value::String(
            self.evidence_type.clone(),
        ))
        .map_err(|e| LedgerError::Corrupt {
            evidence_id: self.evidence_id.clone(),
            detail: format!("unknown evidence type: {e}"),
        })?;

        Ok(EvidenceRecord {
            evidence_id: self.evidence_id,
            control_id: self.control_id,
            control_name: self.control_name,
            task_id: self.task_id,
            collected_at,
            source: self.source,
            collector_version: self.collector_version,
            evidence_type,
            record_version: self.record_version,
            summary,
            finding,
            raw_data: None,
            content_hash: self.content_hash,
            previous_hash: self.previous_hash,
        })
    }
}

const ROW_COLUMNS: &str = "seq, evidence_id, control_id, control_name, task_id, collected_at, \
     source, collector_version, evidence_type, record_version, summary, status, severity, note, \
     raw_data_path, raw_data_sha256, content_hash, previous_hash";

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        seq: row.get::<_, i64>(0)?.unsigned_abs(),
        evidence_id: row.get(1)?,
        control_id: row.get(2)?,
        control_name: row.get(3)?,
        task_id: row.get(4)?,
        collected_at: row.get(5)?,
        source: row.get(6)?,
        collector_version: row.get(7)?,
        evidence_type: row.get(8)?,
        record_version: row.get::<_, i64>(9)?.unsigned_abs() as u32,
        summary: row.get(10)?,
        status: row.get(11)?,
        severity: row.get(12)?,
        note: row.get(13)?,
        raw_data_path: row.get(14)?,
        raw_data_sha256: row.get(15)?,
        content_hash: row.get(16)?,
        previous_hash: row.get(17)?,
    })
}

/// The append-only evidence ledger.
///
/// Concurrent appends to different controls proceed independently at the
/// API level; appends to the same control are serialized through a
/// per-control lock so `previous_hash` is never computed from a stale
/// chain head. The read-extend-update step itself runs inside one SQLite
/// transaction.
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
    evidence_dir: PathBuf,
    chain_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Ledger {
    /// Opens or creates a ledger database, creating the evidence directory
    /// for raw artifacts if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized,
    /// or the evidence directory cannot be created.
    pub fn open(
        db_path: impl AsRef<Path>,
        evidence_dir: impl AsRef<Path>,
    ) -> Result<Self, LedgerError> {
        let db_path = db_path.as_ref();
        let evidence_dir = evidence_dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&evidence_dir).map_err(|source| LedgerError::Io {
            path: evidence_dir.display().to_string(),
            source,
        })?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(db = %db_path.display(), evidence_dir = %evidence_dir.display(), "ledger opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            evidence_dir,
            chain_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Creates an in-memory ledger for testing; raw artifacts go under
    /// `evidence_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory(evidence_dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let evidence_dir = evidence_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&evidence_dir).map_err(|source| LedgerError::Io {
            path: evidence_dir.display().to_string(),
            source,
        })?;
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            evidence_dir,
            chain_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The directory raw evidence artifacts are written under.
    #[must_use]
    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }

    /// Appends a record, extending its control's hash chain.
    ///
    /// The record's `finding` must already be final: this method freezes
    /// the record. It assigns the evidence ID (when empty), writes the raw
    /// payload artifact, computes `previous_hash` from the chain head and
    /// `content_hash` over the canonical form, then inserts the row and
    /// the updated chain head in a single transaction. On any failure no
    /// row is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be written, canonical
    /// serialization fails, or the database rejects the insert.
    pub fn append(&self, mut record: EvidenceRecord) -> Result<EvidenceRecord, LedgerError> {
        // Serialize chain extension per control.
        let control_lock = self.chain_lock(&record.control_id)?;
        let _chain_guard = control_lock.lock().map_err(|_| LedgerError::LockPoisoned)?;

        if record.evidence_id.is_empty() {
            record.evidence_id = Self::generate_evidence_id(&record);
        }
        let collected_at = record.canonical_timestamp();

        // Raw payload goes to a date/control-grouped artifact file; the
        // record carries its path and digest so the artifact stays
        // independently verifiable.
        let raw_artifact = match &record.raw_data {
            Some(raw) => Some(self.write_raw_artifact(&record, raw)?),
            None => None,
        };

        let summary_json = serde_json::to_string(&record.summary).map_err(|e| {
            LedgerError::Corrupt {
                evidence_id: record.evidence_id.clone(),
                detail: format!("summary not serializable: {e}"),
            }
        })?;

        let result = self.append_tx(&record, &collected_at, &summary_json, raw_artifact.as_ref());

        match result {
            Ok((content_hash, previous_hash)) => {
                record.content_hash = content_hash;
                record.previous_hash = previous_hash;
                debug!(
                    evidence_id = %record.evidence_id,
                    control_id = %record.control_id,
                    status = %record.finding.status,
                    "evidence appended"
                );
                Ok(record)
            }
            Err(err) => {
                // All-or-nothing: drop the orphaned artifact if the row
                // was not persisted.
                if let Some((path, _)) = raw_artifact {
                    let full = self.evidence_dir.join(&path);
                    if let Err(io_err) = std::fs::remove_file(&full) {
                        warn!(path = %full.display(), error = %io_err, "failed to remove orphaned artifact");
                    }
                }
                Err(err)
            }
        }
    }

    /// The chain-extension transaction: read head, hash, insert, update head.
    fn append_tx(
        &self,
        record: &EvidenceRecord,
        collected_at: &str,
        summary_json: &str,
        raw_artifact: Option<&(String, String)>,
    ) -> Result<(String, String), LedgerError> {
        let mut conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let tx = conn.transaction()?;

        let previous_hash: String = tx
            .query_row(
                "SELECT head_hash FROM chain_heads WHERE control_id = ?1",
                params![record.control_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());

        let canonical = CanonicalEvidence {
            evidence_id: &record.evidence_id,
            control_id: &record.control_id,
            control_name: &record.control_name,
            task_id: &record.task_id,
            collected_at,
            source: &record.source,
            collector_version: &record.collector_version,
            evidence_type: record.evidence_type,
            record_version: record.record_version,
            summary: &record.summary,
            finding: &record.finding,
            raw_data_sha256: raw_artifact.map(|(_, digest)| digest.as_str()),
        };
        let content_hash = sha256_hex(&canonical.to_bytes()?);

        tx.execute(
            "INSERT INTO evidence (evidence_id, control_id, control_name, task_id, collected_at, \
             source, collector_version, evidence_type, record_version, summary, status, severity, \
             note, raw_data_path, raw_data_sha256, content_hash, previous_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                record.evidence_id,
                record.control_id,
                record.control_name,
                record.task_id,
                collected_at,
                record.source,
                record.collector_version,
                record.evidence_type.to_string(),
                record.record_version,
                summary_json,
                record.finding.status.as_str(),
                record.finding.severity.as_str(),
                record.finding.note,
                raw_artifact.map(|(path, _)| path.as_str()),
                raw_artifact.map(|(_, digest)| digest.as_str()),
                content_hash,
                previous_hash,
            ],
        )?;
        let seq = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO chain_heads (control_id, head_hash, head_seq) VALUES (?1, ?2, ?3)
             ON CONFLICT(control_id) DO UPDATE SET head_hash = ?2, head_seq = ?3",
            params![record.control_id, content_hash, seq],
        )?;

        tx.commit()?;
        Ok((content_hash, previous_hash))
    }

    /// Most recent record for a control, or `None` if never collected.
    pub fn latest(&self, control_id: &str) -> Result<Option<EvidenceRecord>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ROW_COLUMNS} FROM evidence WHERE control_id = ?1 \
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![control_id],
                row_from_sql,
            )
            .optional()?;
        row.map(StoredRow::into_record).transpose()
    }

    /// A page of a control's history in chain order, starting after
    /// `cursor` (a sequence number; pass 0 to start from the beginning).
    ///
    /// The cursor makes the walk restartable: pass the `seq` of the last
    /// record seen to resume.
    pub fn history_from(
        &self,
        control_id: &str,
        cursor: u64,
        limit: u64,
    ) -> Result<Vec<(u64, EvidenceRecord)>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROW_COLUMNS} FROM evidence WHERE control_id = ?1 AND seq > ?2 \
             ORDER BY seq ASC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![control_id, cursor, limit], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|row| {
                let seq = row.seq;
                row.into_record().map(|r| (seq, r))
            })
            .collect()
    }

    /// Full history for a control in chain order (oldest first).
    pub fn history(&self, control_id: &str) -> Result<Vec<EvidenceRecord>, LedgerError> {
        let mut records = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.history_from(control_id, cursor, 256)?;
            match page.last() {
                Some(&(last_seq, _)) => cursor = last_seq,
                None => break,
            }
            records.extend(page.into_iter().map(|(_, r)| r));
        }
        Ok(records)
    }

    /// Records collected within `[from, to)`, across all controls,
    /// ordered by collection time. Timestamps are stored in RFC 3339 UTC,
    /// so lexicographic comparison matches chronological order.
    pub fn records_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EvidenceRecord>, LedgerError> {
        let from = from.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let to = to.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROW_COLUMNS} FROM evidence \
             WHERE collected_at >= ?1 AND collected_at < ?2 \
             ORDER BY collected_at ASC, seq ASC"
        ))?;
        let rows = stmt
            .query_map(params![from, to], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_record).collect()
    }

    /// Looks up a record by evidence ID.
    pub fn get(&self, evidence_id: &str) -> Result<Option<EvidenceRecord>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let row = conn
            .query_row(
                &format!("SELECT {ROW_COLUMNS} FROM evidence WHERE evidence_id = ?1"),
                params![evidence_id],
                row_from_sql,
            )
            .optional()?;
        row.map(StoredRow::into_record).transpose()
    }

    /// The most recent record for every control that has one.
    pub fn latest_by_control(
        &self,
    ) -> Result<std::collections::BTreeMap<String, EvidenceRecord>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evidence e \
             INNER JOIN chain_heads h ON e.control_id = h.control_id AND e.seq = h.head_seq",
            ROW_COLUMNS.replace("control_id", "e.control_id")
        ))?;
        let rows = stmt
            .query_map([], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut latest = std::collections::BTreeMap::new();
        for row in rows {
            let control_id = row.control_id.clone();
            latest.insert(control_id, row.into_record()?);
        }
        Ok(latest)
    }

    /// Every record in the ledger, in append order.
    pub fn all(&self) -> Result<Vec<EvidenceRecord>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut stmt =
            conn.prepare(&format!("SELECT {ROW_COLUMNS} FROM evidence ORDER BY seq ASC"))?;
        let rows = stmt
            .query_map([], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_record).collect()
    }

    /// All controls with at least one record, sorted.
    pub fn controls(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT control_id FROM evidence ORDER BY control_id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Ledger statistics.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let (record_count, max_seq): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(MAX(seq), 0) FROM evidence",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let control_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM chain_heads", [], |row| row.get(0))?;
        Ok(LedgerStats {
            record_count: record_count.unsigned_abs(),
            control_count: control_count.unsigned_abs(),
            max_seq: max_seq.unsigned_abs(),
        })
    }

    // -- internals ----------------------------------------------------------

    /// All stored rows for a control in chain order, in persisted string
    /// form. Used by integrity verification.
    pub(crate) fn stored_chain(&self, control_id: &str) -> Result<Vec<StoredRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROW_COLUMNS} FROM evidence WHERE control_id = ?1 ORDER BY seq ASC"
        ))?;
        let rows = stmt
            .query_map(params![control_id], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Union of controls present in the evidence table or the chain-head
    /// index, so verification still sees a control whose rows were all
    /// deleted out from under its index entry.
    pub(crate) fn chain_controls(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT control_id FROM evidence \
             UNION SELECT control_id FROM chain_heads ORDER BY control_id",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The indexed chain head for a control, if any.
    pub(crate) fn chain_head(&self, control_id: &str) -> Result<Option<String>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(conn
            .query_row(
                "SELECT head_hash FROM chain_heads WHERE control_id = ?1",
                params![control_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn chain_lock(&self, control_id: &str) -> Result<Arc<Mutex<()>>, LedgerError> {
        let mut locks = self
            .chain_locks
            .lock()
            .map_err(|_| LedgerError::LockPoisoned)?;
        Ok(locks
            .entry(control_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn generate_evidence_id(record: &EvidenceRecord) -> String {
        let date = record.collected_at.format("%Y-%m-%d");
        let control = record.control_id.replace('.', "");
        let suffix = Uuid::new_v4().simple().to_string();
        format!("ev-{date}-{control}-{}", &suffix[..8])
    }

    /// Writes the raw payload artifact, returning its relative path and
    /// SHA-256 digest.
    fn write_raw_artifact(
        &self,
        record: &EvidenceRecord,
        raw: &serde_json::Value,
    ) -> Result<(String, String), LedgerError> {
        let date_dir = record.collected_at.format("%Y-%m-%d").to_string();
        let dir = self.evidence_dir.join(&date_dir);
        std::fs::create_dir_all(&dir).map_err(|source| LedgerError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let control = record.control_id.replace('.', "_");
        let suffix = &record.evidence_id[record.evidence_id.len().saturating_sub(8)..];
        let file_name = format!("{control}_{}_{suffix}.raw.json", record.task_id);
        let full_path = dir.join(&file_name);

        let bytes =
            serde_json::to_vec_pretty(raw).map_err(|e| LedgerError::Corrupt {
                evidence_id: record.evidence_id.clone(),
                detail: format!("raw payload not serializable: {e}"),
            })?;
        let digest = sha256_hex(&bytes);

        std::fs::write(&full_path, &bytes).map_err(|source| LedgerError::Io {
            path: full_path.display().to_string(),
            source,
        })?;

        Ok((format!("{date_dir}/{file_name}"), digest))
    }
}
