//! Tests for the evidence ledger.

use rusqlite::{Connection, params};
use tempfile::TempDir;

use crate::evidence::{
    ComplianceStatus, EvidenceRecord, EvidenceType, Finding, GENESIS_PREV_HASH, Severity,
    SummaryValue,
};

use super::*;

/// Helper to create a file-backed ledger in a temp directory.
fn temp_ledger() -> (Ledger, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("evidence.db");
    let evidence_dir = dir.path().join("evidence");
    let ledger = Ledger::open(&db_path, &evidence_dir).expect("failed to open ledger");
    (ledger, dir)
}

/// Opens a second connection to the same database for tampering.
fn raw_conn(dir: &TempDir) -> Connection {
    Connection::open(dir.path().join("evidence.db")).expect("failed to open raw connection")
}

fn sample_record(control_id: &str, task_id: &str) -> EvidenceRecord {
    let mut record = EvidenceRecord::new(
        control_id,
        "Authentication information",
        task_id,
        "directory_platform",
        EvidenceType::Snapshot,
    );
    record.summary.insert("mfa_coverage".into(), SummaryValue::Number(97.5));
    record.summary.insert("total_users".into(), SummaryValue::Number(120.0));
    record.finding = Finding {
        status: ComplianceStatus::Partial,
        severity: Severity::Medium,
        note: "MFA coverage below 100%".into(),
    };
    record
}

#[test]
fn open_creates_empty_ledger() {
    let (ledger, _dir) = temp_ledger();
    let stats = ledger.stats().expect("failed to get stats");
    assert_eq!(stats.record_count, 0);
    assert_eq!(stats.control_count, 0);
    assert_eq!(stats.max_seq, 0);
}

#[test]
fn append_assigns_id_and_hashes() {
    let (ledger, _dir) = temp_ledger();

    let frozen = ledger.append(sample_record("A.5.17", "mfa_enrollment")).unwrap();

    assert!(frozen.evidence_id.starts_with("ev-"));
    assert!(frozen.evidence_id.contains("A517"));
    assert_eq!(frozen.content_hash.len(), 64);
    assert_eq!(frozen.previous_hash, GENESIS_PREV_HASH);

    let stats = ledger.stats().unwrap();
    assert_eq!(stats.record_count, 1);
    assert_eq!(stats.control_count, 1);
}

#[test]
fn appends_link_into_a_chain() {
    let (ledger, _dir) = temp_ledger();

    let first = ledger.append(sample_record("A.5.17", "t1")).unwrap();
    let second = ledger.append(sample_record("A.5.17", "t2")).unwrap();
    let third = ledger.append(sample_record("A.5.17", "t3")).unwrap();

    assert_eq!(first.previous_hash, GENESIS_PREV_HASH);
    assert_eq!(second.previous_hash, first.content_hash);
    assert_eq!(third.previous_hash, second.content_hash);
}

#[test]
fn chains_are_independent_per_control() {
    let (ledger, _dir) = temp_ledger();

    ledger.append(sample_record("A.5.17", "t1")).unwrap();
    let other_first = ledger.append(sample_record("A.8.2", "t1")).unwrap();

    // The second control starts its own chain from genesis.
    assert_eq!(other_first.previous_hash, GENESIS_PREV_HASH);
}

#[test]
fn latest_returns_most_recent() {
    let (ledger, _dir) = temp_ledger();

    assert!(ledger.latest("A.5.17").unwrap().is_none());

    ledger.append(sample_record("A.5.17", "t1")).unwrap();
    let second = ledger.append(sample_record("A.5.17", "t2")).unwrap();

    let latest = ledger.latest("A.5.17").unwrap().unwrap();
    assert_eq!(latest.evidence_id, second.evidence_id);
    assert_eq!(latest.task_id, "t2");
}

#[test]
fn history_is_in_chain_order() {
    let (ledger, _dir) = temp_ledger();

    for i in 0..5 {
        ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap();
    }

    let history = ledger.history("A.5.17").unwrap();
    assert_eq!(history.len(), 5);
    let task_ids: Vec<&str> = history.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(task_ids, vec!["t0", "t1", "t2", "t3", "t4"]);

    // Each record links to its predecessor.
    for pair in history.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].content_hash);
    }
}

#[test]
fn history_cursor_is_restartable() {
    let (ledger, _dir) = temp_ledger();

    for i in 0..4 {
        ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap();
    }

    let first_page = ledger.history_from("A.5.17", 0, 2).unwrap();
    assert_eq!(first_page.len(), 2);

    let (cursor, _) = first_page[1].clone();
    let second_page = ledger.history_from("A.5.17", cursor, 10).unwrap();
    assert_eq!(second_page.len(), 2);
    assert_eq!(second_page[0].1.task_id, "t2");
}

#[test]
fn records_between_filters_by_time() {
    let (ledger, _dir) = temp_ledger();

    let before = chrono::Utc::now() - chrono::Duration::seconds(1);
    ledger.append(sample_record("A.5.17", "t1")).unwrap();
    ledger.append(sample_record("A.8.2", "t1")).unwrap();
    let after = chrono::Utc::now() + chrono::Duration::seconds(1);

    let all = ledger.records_between(before, after).unwrap();
    assert_eq!(all.len(), 2);

    let none = ledger.records_between(after, after + chrono::Duration::hours(1)).unwrap();
    assert!(none.is_empty());
}

#[test]
fn get_by_evidence_id() {
    let (ledger, _dir) = temp_ledger();
    let frozen = ledger.append(sample_record("A.5.17", "t1")).unwrap();

    let fetched = ledger.get(&frozen.evidence_id).unwrap().unwrap();
    assert_eq!(fetched.control_id, "A.5.17");
    assert_eq!(fetched.content_hash, frozen.content_hash);
    assert_eq!(fetched.summary, frozen.summary);

    assert!(ledger.get("ev-nonexistent").unwrap().is_none());
}

#[test]
fn all_returns_append_order() {
    let (ledger, _dir) = temp_ledger();

    ledger.append(sample_record("A.5.17", "t1")).unwrap();
    ledger.append(sample_record("A.8.2", "t1")).unwrap();
    ledger.append(sample_record("A.5.17", "t2")).unwrap();

    let all = ledger.all().unwrap();
    assert_eq!(all.len(), 3);
    let controls: Vec<&str> = all.iter().map(|r| r.control_id.as_str()).collect();
    assert_eq!(controls, vec!["A.5.17", "A.8.2", "A.5.17"]);
}

#[test]
fn latest_by_control_maps_heads() {
    let (ledger, _dir) = temp_ledger();

    ledger.append(sample_record("A.5.17", "t1")).unwrap();
    let head_a = ledger.append(sample_record("A.5.17", "t2")).unwrap();
    let head_b = ledger.append(sample_record("A.8.2", "t1")).unwrap();

    let latest = ledger.latest_by_control().unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest["A.5.17"].evidence_id, head_a.evidence_id);
    assert_eq!(latest["A.8.2"].evidence_id, head_b.evidence_id);
}

#[test]
fn raw_artifact_written_and_digested() {
    let (ledger, dir) = temp_ledger();

    let record = sample_record("A.5.17", "t1")
        .with_raw_data(serde_json::json!([{"userPrincipalName": "a@example.com"}]));
    let frozen = ledger.append(record).unwrap();

    // The artifact file exists under a date directory and hashes correctly.
    let conn = raw_conn(&dir);
    let (path, digest): (String, String) = conn
        .query_row(
            "SELECT raw_data_path, raw_data_sha256 FROM evidence WHERE evidence_id = ?1",
            params![frozen.evidence_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    let bytes = std::fs::read(ledger.evidence_dir().join(&path)).unwrap();
    assert_eq!(crate::crypto::sha256_hex(&bytes), digest);
}

#[test]
fn collection_error_records_enter_the_chain() {
    let (ledger, _dir) = temp_ledger();

    let ok = ledger.append(sample_record("A.5.17", "t1")).unwrap();

    let mut error_record = EvidenceRecord::new(
        "A.5.17",
        "Authentication information",
        "t2",
        "directory_platform",
        EvidenceType::Snapshot,
    );
    error_record.finding = Finding::collection_error("timeout after 3 attempts");
    let frozen = ledger.append(error_record).unwrap();

    // Absence of evidence is itself auditable: the error record is linked.
    assert_eq!(frozen.previous_hash, ok.content_hash);
    assert_eq!(frozen.finding.status, ComplianceStatus::CollectionError);
    assert!(ledger.verify().unwrap().is_intact());
}

// -- verification -----------------------------------------------------------

#[test]
fn verify_intact_ledger() {
    let (ledger, _dir) = temp_ledger();

    for i in 0..3 {
        ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap();
        ledger.append(sample_record("A.8.2", &format!("t{i}"))).unwrap();
    }

    let report = ledger.verify().unwrap();
    assert!(report.is_intact());
    assert_eq!(report.chains.len(), 2);
    for status in report.chains.values() {
        assert!(matches!(status, ChainStatus::Intact { length: 3 }));
    }
}

#[test]
fn verify_empty_ledger() {
    let (ledger, _dir) = temp_ledger();
    let report = ledger.verify().unwrap();
    assert!(report.is_intact());
    assert!(report.chains.is_empty());
}

#[test]
fn verify_is_idempotent() {
    let (ledger, _dir) = temp_ledger();
    for i in 0..3 {
        ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap();
    }

    let first = serde_json::to_string(&ledger.verify().unwrap().chains).unwrap();
    let second = serde_json::to_string(&ledger.verify().unwrap().chains).unwrap();
    assert_eq!(first, second);
}

#[test]
fn mutation_is_detected_at_position() {
    let (ledger, dir) = temp_ledger();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap().evidence_id);
    }
    ledger.append(sample_record("A.8.2", "t0")).unwrap();

    // Tamper with the middle record's summary.
    raw_conn(&dir)
        .execute(
            "UPDATE evidence SET summary = ?1 WHERE evidence_id = ?2",
            params![r#"{"mfa_coverage":100.0,"total_users":120.0}"#, ids[1]],
        )
        .unwrap();

    let report = ledger.verify().unwrap();
    assert!(!report.is_intact());

    match &report.chains["A.5.17"] {
        ChainStatus::Broken { fault, .. } => {
            assert_eq!(fault.position, 1);
            assert_eq!(fault.kind, BreakKind::HashMismatch);
            assert_eq!(fault.evidence_id.as_deref(), Some(ids[1].as_str()));
        }
        ChainStatus::Intact { .. } => panic!("expected a break"),
    }

    // The unrelated control must not be flagged.
    assert!(report.chains["A.8.2"].is_intact());
}

#[test]
fn finding_mutation_is_detected() {
    let (ledger, dir) = temp_ledger();
    let frozen = ledger.append(sample_record("A.5.17", "t1")).unwrap();

    // Flip the verdict from PARTIAL to COMPLIANT without rehashing.
    raw_conn(&dir)
        .execute(
            "UPDATE evidence SET status = 'COMPLIANT' WHERE evidence_id = ?1",
            params![frozen.evidence_id],
        )
        .unwrap();

    let report = ledger.verify().unwrap();
    match &report.chains["A.5.17"] {
        ChainStatus::Broken { fault, .. } => {
            assert_eq!(fault.kind, BreakKind::HashMismatch);
            assert_eq!(fault.position, 0);
        }
        ChainStatus::Intact { .. } => panic!("expected a break"),
    }
}

#[test]
fn deletion_of_middle_record_breaks_the_link() {
    let (ledger, dir) = temp_ledger();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap().evidence_id);
    }

    raw_conn(&dir)
        .execute("DELETE FROM evidence WHERE evidence_id = ?1", params![ids[1]])
        .unwrap();

    let report = ledger.verify().unwrap();
    match &report.chains["A.5.17"] {
        ChainStatus::Broken { fault, .. } => {
            // The record after the gap no longer links to its predecessor.
            assert_eq!(fault.kind, BreakKind::BrokenLink);
            assert_eq!(fault.position, 1);
        }
        ChainStatus::Intact { .. } => panic!("expected a break"),
    }
}

#[test]
fn truncation_of_chain_tail_is_detected() {
    let (ledger, dir) = temp_ledger();

    for i in 0..3 {
        ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap();
    }

    raw_conn(&dir)
        .execute(
            "DELETE FROM evidence WHERE seq = (SELECT MAX(seq) FROM evidence)",
            [],
        )
        .unwrap();

    let report = ledger.verify().unwrap();
    match &report.chains["A.5.17"] {
        ChainStatus::Broken { fault, length } => {
            assert_eq!(*length, 2);
            assert_eq!(fault.position, 2);
            assert_eq!(fault.kind, BreakKind::BrokenLink);
        }
        ChainStatus::Intact { .. } => panic!("expected a break"),
    }
}

#[test]
fn full_chain_deletion_is_detected() {
    let (ledger, dir) = temp_ledger();

    ledger.append(sample_record("A.5.17", "t1")).unwrap();
    raw_conn(&dir)
        .execute("DELETE FROM evidence WHERE control_id = 'A.5.17'", [])
        .unwrap();

    // The chain-head index still knows about the control.
    let report = ledger.verify().unwrap();
    assert!(!report.is_intact());
    assert!(matches!(
        &report.chains["A.5.17"],
        ChainStatus::Broken { length: 0, .. }
    ));
}

#[test]
fn reordering_is_detected() {
    let (ledger, dir) = temp_ledger();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap().evidence_id);
    }

    // Swap the first two records' positions.
    let conn = raw_conn(&dir);
    conn.execute("UPDATE evidence SET seq = 1000 WHERE evidence_id = ?1", params![ids[0]])
        .unwrap();
    conn.execute("UPDATE evidence SET seq = 1 WHERE evidence_id = ?1", params![ids[1]])
        .unwrap();
    conn.execute("UPDATE evidence SET seq = 2 WHERE evidence_id = ?1", params![ids[0]])
        .unwrap();

    let report = ledger.verify().unwrap();
    match &report.chains["A.5.17"] {
        ChainStatus::Broken { fault, .. } => {
            assert_eq!(fault.kind, BreakKind::BrokenLink);
            assert_eq!(fault.position, 0);
        }
        ChainStatus::Intact { .. } => panic!("expected a break"),
    }
}

#[test]
fn forged_insertion_is_detected() {
    let (ledger, dir) = temp_ledger();

    for i in 0..2 {
        ledger.append(sample_record("A.5.17", &format!("t{i}"))).unwrap();
    }

    // Forge a row mid-chain without recomputing downstream hashes. The
    // forged record reuses the genesis previous_hash, so the walk breaks.
    raw_conn(&dir)
        .execute(
            "INSERT INTO evidence (evidence_id, control_id, control_name, task_id, collected_at, \
             source, collector_version, evidence_type, record_version, summary, status, severity, \
             note, content_hash, previous_hash, seq)
             VALUES ('ev-forged', 'A.5.17', 'Forged', 'tX', '2026-01-01T00:00:00.000000Z', \
             'attacker', '0.0.0', 'snapshot', 1, '{}', 'COMPLIANT', 'NONE', '', 'deadbeef', '', 1000)",
            [],
        )
        .unwrap();

    let report = ledger.verify().unwrap();
    assert!(!report.is_intact());
}

#[test]
fn raw_artifact_tampering_is_detected() {
    let (ledger, dir) = temp_ledger();

    let record = sample_record("A.5.17", "t1")
        .with_raw_data(serde_json::json!({"policies": ["baseline"]}));
    let frozen = ledger.append(record).unwrap();

    assert!(ledger.verify().unwrap().is_intact());

    // Rewrite the artifact file body.
    let path: String = raw_conn(&dir)
        .query_row(
            "SELECT raw_data_path FROM evidence WHERE evidence_id = ?1",
            params![frozen.evidence_id],
            |row| row.get(0),
        )
        .unwrap();
    std::fs::write(
        ledger.evidence_dir().join(&path),
        br#"{"policies": ["weakened"]}"#,
    )
    .unwrap();

    let report = ledger.verify().unwrap();
    match &report.chains["A.5.17"] {
        ChainStatus::Broken { fault, .. } => {
            assert_eq!(fault.kind, BreakKind::HashMismatch);
            assert!(fault.detail.contains("artifact"));
        }
        ChainStatus::Intact { .. } => panic!("expected a break"),
    }
}

#[test]
fn concurrent_appends_keep_chains_intact() {
    let (ledger, _dir) = temp_ledger();
    let ledger = std::sync::Arc::new(ledger);

    let mut handles = Vec::new();
    for worker in 0..4 {
        let ledger = ledger.clone();
        handles.push(std::thread::spawn(move || {
            let control = format!("A.{worker}.1");
            for i in 0..10 {
                ledger
                    .append(sample_record(&control, &format!("t{i}")))
                    .expect("append failed");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let report = ledger.verify().unwrap();
    assert!(report.is_intact());
    assert_eq!(report.chains.len(), 4);
    for status in report.chains.values() {
        assert!(matches!(status, ChainStatus::Intact { length: 10 }));
    }
}

mod properties {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // Any interleaving of appends across controls verifies intact, and
        // every chain links end to end.
        #[test]
        fn appended_ledgers_always_verify(controls in prop::collection::vec(0u8..4, 1..24)) {
            let (ledger, _dir) = temp_ledger();
            for (i, control) in controls.iter().enumerate() {
                let record = sample_record(&format!("C.{control}"), &format!("t{i}"));
                ledger.append(record).unwrap();
            }
            prop_assert!(ledger.verify().unwrap().is_intact());
        }
    }
}
