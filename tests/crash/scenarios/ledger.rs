//! Crash inside a ledger append

use lrledger::crash_point::points;
use lrledger::ledger::LedgerStore;

use crate::crash::harness::{crash_then_restart, Workspace};

fn assert_recovers_from(point: &str) {
    let workspace = Workspace::new();
    let file = workspace.write_batch("a.json", 3);

    let (_, restarted) = crash_then_restart(&workspace, &file, point);
    assert_eq!(restarted.state(), "completed", "{}", point);

    // Whatever part of the append survived, no numbers are burned
    let receipt = &restarted.data()["receipt"];
    assert_eq!(receipt["first_id"], "BR01-0001", "{}", point);
    assert_eq!(receipt["last_id"], "BR01-0003", "{}", point);
    assert!(workspace.ledger().released_ranges().unwrap().is_empty());
}

#[test]
fn test_crash_before_append() {
    assert_recovers_from(points::LEDGER_BEFORE_APPEND);
}

#[test]
fn test_crash_before_fsync() {
    assert_recovers_from(points::LEDGER_BEFORE_FSYNC);
}

#[test]
fn test_crash_after_fsync() {
    assert_recovers_from(points::LEDGER_AFTER_FSYNC);
}
