//! Crash around the batch commit and artifact delivery

use lrledger::crash_point::points;
use lrledger::ledger::{BatchStatus, LedgerStore};

use crate::crash::harness::{crash_then_restart, hash_of, scope, Workspace};

#[test]
fn test_crash_before_commit_leaves_nothing_committed() {
    let workspace = Workspace::new();
    let file = workspace.write_batch("a.json", 3);

    let crashed = workspace.process(&file, Some(points::BATCH_BEFORE_COMMIT));
    assert!(crashed.crashed);
    assert_eq!(workspace.highest_committed(), None);
    {
        let ledger = workspace.ledger();
        assert!(ledger.committed_batch_for_source(&hash_of(&file)).unwrap().is_none());
        assert_eq!(ledger.outstanding_for_source(&hash_of(&file), &scope()).unwrap().len(), 1);
    }

    let restarted = workspace.process(&file, None);
    assert_eq!(restarted.state(), "completed");
    assert_eq!(restarted.data()["receipt"]["start"], 1);
    assert_eq!(workspace.highest_committed(), Some(3));
}

#[test]
fn test_crash_after_commit_is_skipped_on_restart() {
    let workspace = Workspace::new();
    let file = workspace.write_batch("a.json", 3);

    let crashed = workspace.process(&file, Some(points::BATCH_AFTER_COMMIT));
    assert!(crashed.crashed);

    // The commit reached the disk before the abort
    assert_eq!(workspace.highest_committed(), Some(3));
    let committed = workspace
        .ledger()
        .committed_batch_for_source(&hash_of(&file))
        .unwrap()
        .unwrap();
    assert_eq!(committed.status, BatchStatus::Committed);

    let restarted = workspace.process(&file, None);
    assert_eq!(restarted.state(), "skipped");
    let receipt = &restarted.data()["receipt"];
    assert_eq!(receipt["already_committed"], true);
    assert_eq!(receipt["idempotency_key"], committed.idempotency_key);

    // Nothing new reserved, nothing released
    assert_eq!(workspace.highest_committed(), Some(3));
    let ledger = workspace.ledger();
    assert_eq!(ledger.scope(&scope()).unwrap().unwrap().high_water_mark, 3);
    assert!(ledger.released_ranges().unwrap().is_empty());
}

#[test]
fn test_crash_before_artifact_delivers_on_restart() {
    let workspace = Workspace::new();
    let file = workspace.write_batch("a.json", 2);

    let (_, restarted) = crash_then_restart(&workspace, &file, points::BEFORE_ARTIFACT);
    assert_eq!(restarted.state(), "skipped");

    let manifests = workspace.manifests();
    assert_eq!(manifests.len(), 1);
    assert!(manifests[0].ends_with("lr_batch_BR01_BR01-0001-BR01-0002.json"));
    assert_eq!(workspace.highest_committed(), Some(2));
}
