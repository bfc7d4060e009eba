//! End-to-end record lifecycle tests.
//!
//! Cover the full write path (file, commit, index row, hooks, audit) and
//! the role-gated status workflow.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

#[path = "common/mod.rs"]
mod common;

use crate::common::TestContext;
use civicvault_core::Error;
use civicvault_core::engine::{OpContext, RecordInput};
use civicvault_core::model::activity::ActivityBmc;
use civicvault_core::model::record::{RecordBmc, RecordFilter};
use civicvault_core::store::frontmatter;
use civicvault_core::store::git_store;
use std::path::Path;

fn input(record_type: &str, title: &str) -> RecordInput {
    RecordInput {
        record_type: record_type.to_string(),
        title: title.to_string(),
        content: Some(format!("# {title}\n\nBody.\n")),
        metadata: None,
        authors: Vec::new(),
    }
}

/// Bylaw approval lifecycle: draft -> proposed -> approved -> archived,
/// each step a distinct commit, with the final status everywhere.
#[tokio::test]
async fn test_bylaw_approval_lifecycle() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Noise Restrictions"))
        .await
        .expect("create");
    assert_eq!(record.status, "draft");
    assert_eq!(record.slug.as_str(), "noise-restrictions");
    assert_eq!(record.author, "clerk-ada");

    let id = record.id.as_str();

    let record = engine
        .set_status(&tc.clerk, &op, id, "proposed", None)
        .await
        .expect("clerk proposes");
    assert_eq!(record.status, "proposed");

    let record = engine
        .set_status(&tc.council, &op, id, "approved", None)
        .await
        .expect("council approves");
    assert_eq!(record.status, "approved");

    let record = engine
        .set_status(&tc.council, &op, id, "archived", None)
        .await
        .expect("council archives");
    assert_eq!(record.status, "archived");

    // Four distinct commits touch the record file.
    let revisions = engine.history(&tc.system, id).await.expect("history");
    assert_eq!(revisions.len(), 4);
    let oids: std::collections::BTreeSet<_> = revisions.iter().map(|r| r.oid.clone()).collect();
    assert_eq!(oids.len(), 4);

    // One status-changed emission per transition, all audited.
    let count = ActivityBmc::count_action(&tc.system, &tc.container.mm, "hook:record:status-changed")
        .await
        .expect("count");
    assert_eq!(count, 3);

    // index.yml reflects the final status.
    let index = tc.container.indexing.generate(&tc.system).await.expect("index");
    let entry = index
        .entries
        .iter()
        .find(|e| e.id == "bylaw/noise-restrictions")
        .expect("entry present");
    assert_eq!(entry.status, "archived");
}

/// After a successful mutation, disk, index DB, and git HEAD agree.
#[tokio::test]
async fn test_stores_agree_after_write() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("policy", "Park Hours"))
        .await
        .expect("create");
    engine
        .set_status(&tc.clerk, &op, record.id.as_str(), "proposed", None)
        .await
        .expect("propose");

    // Disk.
    let doc = tc
        .container
        .mm
        .record_store()
        .read(Path::new(&record.path))
        .expect("read file");
    assert_eq!(doc.front.status, "proposed");
    assert_eq!(doc.front.id.as_deref(), Some("policy/park-hours"));

    // DB.
    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row");
    assert_eq!(row.status, "proposed");
    assert_eq!(row.updated_at, doc.front.updated_at.unwrap());

    // Git HEAD.
    let repo = tc.container.mm.open_repo().expect("repo");
    let head = git_store::head_oid(&repo).expect("head").expect("non-empty");
    let committed = git_store::read_file_at_commit(&repo, head, Path::new(&record.path))
        .expect("show")
        .expect("present at HEAD");
    let committed_doc = frontmatter::parse(&committed, &record.path).expect("parse");
    assert_eq!(committed_doc.front.status, "proposed");
}

/// Denied transition: exact message, and no store is touched.
#[tokio::test]
async fn test_denied_transition_changes_nothing() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Curfew"))
        .await
        .expect("create");
    let head_before = tc.head();

    let err = engine
        .set_status(&tc.clerk, &op, record.id.as_str(), "approved", None)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Role 'clerk' cannot transition from 'draft' to 'approved'"
    );

    // No commit, no row change, no file change.
    assert_eq!(tc.head(), head_before);
    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row");
    assert_eq!(row.status, "draft");
    let doc = tc
        .container
        .mm
        .record_store()
        .read(Path::new(&record.path))
        .expect("read");
    assert_eq!(doc.front.status, "draft");
}

/// Principal without create permission never touches FS, DB, or git.
#[tokio::test]
async fn test_denied_create_touches_nothing() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();
    let head_before = tc.head();

    let err = engine
        .create(&tc.public, &op, input("bylaw", "Sneaky"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Denied { .. }));

    assert_eq!(tc.head(), head_before);
    assert!(
        !tc.data_dir().join("records/bylaw/sneaky.md").exists(),
        "no file may be written"
    );
    let page = RecordBmc::list(&tc.system, &tc.container.mm, &RecordFilter::default().with_default_page())
        .await
        .expect("list");
    assert!(page.items.is_empty());
}

/// Slug collision: second identical title gets `-2`, both are indexed.
#[tokio::test]
async fn test_slug_collision_suffix() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let first = engine
        .create(&tc.clerk, &op, input("bylaw", "Noise Restrictions"))
        .await
        .expect("first");
    let second = engine
        .create(&tc.clerk, &op, input("bylaw", "Noise Restrictions"))
        .await
        .expect("second");

    assert_eq!(first.slug.as_str(), "noise-restrictions");
    assert_eq!(second.slug.as_str(), "noise-restrictions-2");
    assert!(tc.data_dir().join("records/bylaw/noise-restrictions.md").exists());
    assert!(tc.data_dir().join("records/bylaw/noise-restrictions-2.md").exists());

    let index = tc.container.indexing.generate(&tc.system).await.expect("index");
    assert_eq!(index.entries.len(), 2);

    let third = engine
        .create(&tc.clerk, &op, input("bylaw", "Noise Restrictions"))
        .await
        .expect("third");
    assert_eq!(third.slug.as_str(), "noise-restrictions-3");
}

/// setStatus to the current status: no commit, audited as unchanged.
#[tokio::test]
async fn test_set_status_idempotent() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("motion", "Adjourn"))
        .await
        .expect("create");
    engine
        .set_status(&tc.clerk, &op, record.id.as_str(), "proposed", None)
        .await
        .expect("propose");
    let head_before = tc.head();

    let again = engine
        .set_status(&tc.clerk, &op, record.id.as_str(), "proposed", None)
        .await
        .expect("no-op");
    assert_eq!(again.status, "proposed");
    assert_eq!(tc.head(), head_before, "no new commit for a no-op");

    let count = ActivityBmc::count_action(&tc.system, &tc.container.mm, "record:status.unchanged")
        .await
        .expect("count");
    assert_eq!(count, 1);
}

/// The public role sees published records only; drafts are missing, not
/// forbidden.
#[tokio::test]
async fn test_public_role_filter() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Leash Law"))
        .await
        .expect("create");

    let err = engine.get(&tc.public, record.id.as_str()).await.unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));

    engine
        .set_status(&tc.clerk, &op, record.id.as_str(), "proposed", None)
        .await
        .expect("propose");
    engine
        .set_status(&tc.council, &op, record.id.as_str(), "approved", None)
        .await
        .expect("approve");

    let visible = engine.get(&tc.public, record.id.as_str()).await.expect("published");
    assert_eq!(visible.status, "approved");

    let page = engine
        .list(&tc.public, RecordFilter::default())
        .await
        .expect("list");
    assert_eq!(page.items.len(), 1);
}

/// History and diff are gated like get: the public role cannot read a
/// draft's commits or diffs.
#[tokio::test]
async fn test_public_cannot_read_draft_history_or_diff() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("bylaw", "Fence Heights"))
        .await
        .expect("create");
    engine
        .update(
            &tc.clerk,
            &op,
            record.id.as_str(),
            civicvault_core::engine::RecordPatch {
                content: Some("Revised body.\n".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("update");

    let revisions = engine.history(&tc.clerk, record.id.as_str()).await.expect("history");
    assert_eq!(revisions.len(), 2);
    let (rev1, rev2) = (revisions[1].oid.clone(), revisions[0].oid.clone());

    // Unpublished: indistinguishable from missing for public.
    let err = engine.history(&tc.public, record.id.as_str()).await.unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));
    let err = engine
        .diff(&tc.public, record.id.as_str(), &rev1, &rev2)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));

    // Published: both open up.
    engine
        .set_status(&tc.clerk, &op, record.id.as_str(), "proposed", None)
        .await
        .expect("propose");
    engine
        .set_status(&tc.council, &op, record.id.as_str(), "approved", None)
        .await
        .expect("approve");

    let revisions = engine.history(&tc.public, record.id.as_str()).await.expect("history");
    assert!(revisions.len() >= 4);
    let diff = engine
        .diff(&tc.public, record.id.as_str(), &rev1, &rev2)
        .await
        .expect("diff");
    assert!(diff.contains("Revised body."));
}

/// Updates merge: body replaces, metadata shallow-merges, title persists.
#[tokio::test]
async fn test_update_merges() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(
            &tc.clerk,
            &op,
            RecordInput {
                metadata: Some(serde_json::json!({"tags": ["parks"], "module": "ops"})),
                ..input("policy", "Watering Schedule")
            },
        )
        .await
        .expect("create");

    let updated = engine
        .update(
            &tc.clerk,
            &op,
            record.id.as_str(),
            civicvault_core::engine::RecordPatch {
                content: Some("New body.\n".to_string()),
                metadata: Some(serde_json::json!({"tags": ["parks", "water"]})),
                ..Default::default()
            },
        )
        .await
        .expect("update");

    assert_eq!(updated.content, "New body.\n");
    assert_eq!(updated.title, "Watering Schedule");
    assert_eq!(updated.metadata["tags"], serde_json::json!(["parks", "water"]));
    assert_eq!(updated.metadata["module"], serde_json::json!("ops"));
    assert!(updated.updated_at >= updated.created_at);
}

/// Optimistic concurrency: a stale expected_updated_at is a conflict.
#[tokio::test]
async fn test_stale_update_conflict() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.clerk, &op, input("policy", "Snow Removal"))
        .await
        .expect("create");

    let stale_op = OpContext {
        expected_updated_at: Some(record.updated_at - chrono::Duration::seconds(10)),
        ..Default::default()
    };
    let err = engine
        .update(
            &tc.clerk,
            &stale_op,
            record.id.as_str(),
            civicvault_core::engine::RecordPatch {
                content: Some("x".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StaleUpdate { .. }));
}

/// Delete archives the file, drops the row, and keeps history.
#[tokio::test]
async fn test_delete_archives() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.council, &op, input("motion", "Old Business"))
        .await
        .expect("create");
    engine
        .delete(&tc.council, &op, record.id.as_str())
        .await
        .expect("delete");

    assert!(!tc.data_dir().join("records/motion/old-business.md").exists());
    assert!(tc.data_dir().join("records/archive/motion/old-business.md").exists());

    let err = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));

    let count = ActivityBmc::count_action(&tc.system, &tc.container.mm, "hook:record:deleted")
        .await
        .expect("count");
    assert_eq!(count, 1);
}

/// Restore reverses delete: the file returns to the live tree and the row
/// is rebuilt from its frontmatter.
#[tokio::test]
async fn test_restore_after_delete() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();

    let record = engine
        .create(&tc.council, &op, input("resolution", "Sister City"))
        .await
        .expect("create");
    engine
        .delete(&tc.council, &op, record.id.as_str())
        .await
        .expect("delete");

    let restored = engine
        .restore(&tc.council, &op, record.id.as_str())
        .await
        .expect("restore");
    assert_eq!(restored.id, record.id);
    assert_eq!(restored.title, "Sister City");

    assert!(tc.data_dir().join("records/resolution/sister-city.md").exists());
    assert!(!tc.data_dir().join("records/archive/resolution/sister-city.md").exists());

    let row = RecordBmc::get(&tc.system, &tc.container.mm, &record.id)
        .await
        .expect("row back");
    assert_eq!(row.status, "draft");

    // Archive, restore, and the original create all show in history.
    let revisions = engine.history(&tc.system, record.id.as_str()).await.expect("history");
    assert_eq!(revisions.len(), 3);
}

/// Restoring a record that was never archived is NotFound.
#[tokio::test]
async fn test_restore_missing_archive() {
    let tc = TestContext::new().await.expect("test context");
    let op = OpContext::default();

    let err = tc
        .container
        .engine
        .restore(&tc.council, &op, "bylaw/never-existed")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));
}

/// Storage limits trip before any store is touched.
#[tokio::test]
async fn test_storage_limits() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();
    let head_before = tc.head();

    // Default title cap is 200 chars.
    let long_title = "t".repeat(300);
    let err = engine
        .create(&tc.clerk, &op, input("bylaw", &long_title))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), civicvault_core::ErrorKind::Validation);
    assert_eq!(tc.head(), head_before);
}

/// Unknown record type is a validation failure before any side effect.
#[tokio::test]
async fn test_unknown_type_rejected() {
    let tc = TestContext::new().await.expect("test context");
    let engine = &tc.container.engine;
    let op = OpContext::default();
    let head_before = tc.head();

    let err = engine
        .create(&tc.clerk, &op, input("memo", "Not A Type"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRecordType(_)));
    assert_eq!(tc.head(), head_before);
}
