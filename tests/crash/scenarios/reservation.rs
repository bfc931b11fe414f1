//! Crash between reserving a range and committing it

use lrledger::crash_point::points;
use lrledger::ledger::{LedgerStore, ReservationState};

use crate::crash::harness::{crash_then_restart, hash_of, scope, Workspace};

#[test]
fn test_crash_after_reservation_resumes_same_token() {
    let workspace = Workspace::new();
    let file = workspace.write_batch("a.json", 3);

    let crashed = workspace.process(&file, Some(points::AFTER_RESERVATION));
    assert!(crashed.crashed);

    // The reservation is durable and still outstanding
    let outstanding = {
        let ledger = workspace.ledger();
        let rows = ledger.outstanding_for_source(&hash_of(&file), &scope()).unwrap();
        assert_eq!(rows.len(), 1);
        rows[0].clone()
    };
    assert_eq!((outstanding.start, outstanding.end), (1, 3));
    assert_eq!(workspace.highest_committed(), None);

    let restarted = workspace.process(&file, None);
    assert!(!restarted.crashed, "{}", restarted.stderr);
    assert_eq!(restarted.state(), "completed");

    let receipt = &restarted.data()["receipt"];
    assert_eq!(receipt["token"], outstanding.token.to_string());
    assert_eq!(receipt["start"], 1);
    assert_eq!(receipt["end"], 3);

    let ledger = workspace.ledger();
    assert_eq!(
        ledger.reservation(outstanding.token).unwrap().unwrap().state,
        ReservationState::Committed
    );
    assert!(ledger.released_ranges().unwrap().is_empty());
}

#[test]
fn test_next_file_after_recovery_continues_the_sequence() {
    let workspace = Workspace::new();
    let first = workspace.write_batch("a.json", 2);
    crash_then_restart(&workspace, &first, points::AFTER_RESERVATION);

    let second = workspace.write_batch("b.json", 1);
    let run = workspace.process(&second, None);
    assert_eq!(run.state(), "completed");
    assert_eq!(run.data()["receipt"]["first_id"], "BR01-0003");
    assert_eq!(workspace.highest_committed(), Some(3));
}
