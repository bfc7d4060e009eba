//! Indexing service tests: canonical generation and FS/DB reconciliation.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

#[path = "common/mod.rs"]
mod common;

use crate::common::TestContext;
use civicvault_core::engine::{OpContext, RecordInput};
use civicvault_core::index::ConflictPolicy;
use civicvault_core::model::activity::ActivityBmc;
use civicvault_core::model::record::RecordBmc;
use civicvault_core::store::frontmatter;
use std::path::Path;

fn input(record_type: &str, title: &str) -> RecordInput {
    RecordInput {
        record_type: record_type.to_string(),
        title: title.to_string(),
        content: Some("Body.\n".to_string()),
        metadata: Some(serde_json::json!({"tags": ["civic"], "module": "register"})),
        authors: Vec::new(),
    }
}

/// Generating twice with no changes yields byte-identical index.yml.
#[tokio::test]
async fn test_generate_idempotent() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    engine
        .create(&tc.clerk, &op, input("bylaw", "Noise Restrictions"))
        .await
        .expect("create");
    engine
        .create(&tc.clerk, &op, input("policy", "Park Hours"))
        .await
        .expect("create");

    let index_path = tc.data_dir().join("records/index.yml");

    tc.container.indexing.generate(&tc.system).await.expect("first");
    let first = std::fs::read_to_string(&index_path).expect("read");

    tc.container.indexing.generate(&tc.system).await.expect("second");
    let second = std::fs::read_to_string(&index_path).expect("read");

    assert_eq!(first, second);
}

/// Entries are ordered by (type, slug) and carry the documented shape.
#[tokio::test]
async fn test_index_ordering_and_shape() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    engine.create(&tc.clerk, &op, input("policy", "Zebra")).await.expect("create");
    engine.create(&tc.clerk, &op, input("bylaw", "Alpha")).await.expect("create");
    engine.create(&tc.clerk, &op, input("bylaw", "Beta")).await.expect("create");

    let index = tc.container.indexing.generate(&tc.system).await.expect("index");
    let keys: Vec<_> = index
        .entries
        .iter()
        .map(|e| format!("{}/{}", e.record_type, e.metadata.slug))
        .collect();
    assert_eq!(keys, vec!["bylaw/alpha", "bylaw/beta", "policy/zebra"]);

    assert_eq!(index.metadata.total_records, 3);
    assert_eq!(index.metadata.types, vec!["bylaw", "policy"]);
    assert_eq!(index.metadata.modules, vec!["register"]);
    assert!(index.errors.is_empty());
    assert_eq!(index.entries[0].file, "records/bylaw/alpha.md");
}

/// One malformed record does not block the others; it lands in `errors`.
#[tokio::test]
async fn test_malformed_record_isolated() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    engine.create(&tc.clerk, &op, input("bylaw", "Good")).await.expect("create");
    std::fs::create_dir_all(tc.data_dir().join("records/bylaw")).unwrap();
    std::fs::write(
        tc.data_dir().join("records/bylaw/broken.md"),
        "no frontmatter here\n",
    )
    .unwrap();

    let index = tc.container.indexing.generate(&tc.system).await.expect("index");
    assert_eq!(index.entries.len(), 1);
    assert_eq!(index.errors.len(), 1);
    assert!(index.errors[0].contains("broken.md"));
}

/// Scenario: frontmatter edited directly on disk, then sync with
/// file-wins. The DB row updates, no commit is created, and the
/// resolution is audited.
#[tokio::test]
async fn test_sync_file_wins() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Noise Restrictions"))
        .await
        .expect("create");

    // Hand-edit: draft -> approved, bumping updated_at as an editor would.
    let rel = Path::new(&record.path);
    let mut doc = tc.container.mm.record_store().read(rel).expect("read");
    doc.front.status = "approved".to_string();
    doc.front.updated_at = doc
        .front
        .updated_at
        .map(|t| t + chrono::Duration::seconds(60));
    tc.container.mm.record_store().write(rel, &doc).expect("write");

    let head_before = tc.head();
    let report = tc
        .container
        .indexing
        .sync_db(&tc.system, ConflictPolicy::FileWins)
        .await
        .expect("sync");

    assert_eq!(report.rows_updated, 1);
    assert_eq!(report.conflicts, 0);
    assert_eq!(tc.head(), head_before, "sync must not commit");

    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row");
    assert_eq!(row.status, "approved");

    let resolved =
        ActivityBmc::count_action(&tc.system, &tc.container.mm, "sync.conflict_resolved")
            .await
            .expect("count");
    assert_eq!(resolved, 1);
}

/// database-wins inverts the resolution: the file is rewritten from the
/// row and the DB is untouched.
#[tokio::test]
async fn test_sync_database_wins() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Curfew"))
        .await
        .expect("create");

    let rel = Path::new(&record.path);
    let mut doc = tc.container.mm.record_store().read(rel).expect("read");
    doc.front.status = "approved".to_string();
    tc.container.mm.record_store().write(rel, &doc).expect("write");

    let report = tc
        .container
        .indexing
        .sync_db(&tc.system, ConflictPolicy::DatabaseWins)
        .await
        .expect("sync");
    assert_eq!(report.files_rewritten, 1);

    // File back to the row's status; row unchanged.
    let doc = tc.container.mm.record_store().read(rel).expect("read");
    assert_eq!(doc.front.status, "draft");
    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row");
    assert_eq!(row.status, "draft");
}

/// manual touches neither side and records the conflict.
#[tokio::test]
async fn test_sync_manual_touches_neither() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Leash Law"))
        .await
        .expect("create");

    let rel = Path::new(&record.path);
    let mut doc = tc.container.mm.record_store().read(rel).expect("read");
    doc.front.status = "approved".to_string();
    tc.container.mm.record_store().write(rel, &doc).expect("write");

    let report = tc
        .container
        .indexing
        .sync_db(&tc.system, ConflictPolicy::Manual)
        .await
        .expect("sync");
    assert_eq!(report.conflicts, 1);

    let doc = tc.container.mm.record_store().read(rel).expect("read");
    assert_eq!(doc.front.status, "approved", "file untouched");
    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row");
    assert_eq!(row.status, "draft", "row untouched");

    let detected =
        ActivityBmc::count_action(&tc.system, &tc.container.mm, "sync.conflict_detected")
            .await
            .expect("count");
    assert_eq!(detected, 1);
    // The conflict hook was emitted (audit-first).
    let hook = ActivityBmc::count_action(&tc.system, &tc.container.mm, "hook:record:sync-conflict")
        .await
        .expect("count");
    assert_eq!(hook, 1);
}

/// manual with a missing backing file: the conflict event still fires and
/// the orphan row survives.
#[tokio::test]
async fn test_sync_manual_missing_file_emits_conflict() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Vanished"))
        .await
        .expect("create");
    std::fs::remove_file(tc.data_dir().join(&record.path)).unwrap();

    let report = tc
        .container
        .indexing
        .sync_db(&tc.system, ConflictPolicy::Manual)
        .await
        .expect("sync");
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.rows_deleted, 0);

    // Row untouched.
    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row survives");
    assert_eq!(row.status, "draft");

    let detected =
        ActivityBmc::count_action(&tc.system, &tc.container.mm, "sync.conflict_detected")
            .await
            .expect("count");
    assert_eq!(detected, 1);
    let hook = ActivityBmc::count_action(&tc.system, &tc.container.mm, "hook:record:sync-conflict")
        .await
        .expect("count");
    assert_eq!(hook, 1);
}

/// timestamp: the newer side wins; an exact tie goes to the file.
#[tokio::test]
async fn test_sync_timestamp_newer_wins() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Snow Rules"))
        .await
        .expect("create");

    // File side is newer.
    let rel = Path::new(&record.path);
    let mut doc = tc.container.mm.record_store().read(rel).expect("read");
    doc.front.status = "approved".to_string();
    doc.front.updated_at = doc
        .front
        .updated_at
        .map(|t| t + chrono::Duration::seconds(120));
    tc.container.mm.record_store().write(rel, &doc).expect("write");

    tc.container
        .indexing
        .sync_db(&tc.system, ConflictPolicy::Timestamp)
        .await
        .expect("sync");
    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row");
    assert_eq!(row.status, "approved", "newer file side wins");
}

/// A row whose backing file is gone is dropped under file-wins.
#[tokio::test]
async fn test_sync_file_wins_drops_orphan_rows() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Ghost"))
        .await
        .expect("create");
    std::fs::remove_file(tc.data_dir().join(&record.path)).unwrap();

    let report = tc
        .container
        .indexing
        .sync_db(&tc.system, ConflictPolicy::FileWins)
        .await
        .expect("sync");
    assert_eq!(report.rows_deleted, 1);

    assert!(
        RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
            .await
            .is_err()
    );
}

/// Round-trip law: export, import into an empty store, same list and the
/// same index.yml.
#[tokio::test]
async fn test_export_import_round_trip() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    engine
        .create(&tc.clerk, &op, input("bylaw", "Noise Restrictions"))
        .await
        .expect("create");
    engine
        .create(&tc.clerk, &op, input("resolution", "Budget 2026"))
        .await
        .expect("create");

    tc.container.indexing.generate(&tc.system).await.expect("index");
    let original_index = std::fs::read_to_string(tc.data_dir().join("records/index.yml")).unwrap();

    let export_dir = tempfile::tempdir().unwrap();
    let copied = engine.export(&tc.system, export_dir.path()).await.expect("export");
    assert!(copied >= 2);

    // Import into a brand-new store.
    let tc2 = TestContext::new().await.expect("second context");
    let imported = tc2
        .container
        .engine
        .import(&tc2.system, &op, export_dir.path())
        .await
        .expect("import");
    assert_eq!(imported, 2);

    tc2.container.indexing.generate(&tc2.system).await.expect("index");
    let round_tripped =
        std::fs::read_to_string(tc2.data_dir().join("records/index.yml")).unwrap();
    assert_eq!(original_index, round_tripped);

    // Same frontmatter, bit for bit, after parse.
    let doc1 = tc
        .container
        .mm
        .record_store()
        .read(Path::new("records/bylaw/noise-restrictions.md"))
        .expect("read original");
    let doc2 = tc2
        .container
        .mm
        .record_store()
        .read(Path::new("records/bylaw/noise-restrictions.md"))
        .expect("read imported");
    assert_eq!(frontmatter::serialize(&doc1).unwrap(), frontmatter::serialize(&doc2).unwrap());
}
