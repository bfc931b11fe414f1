//! Every crash point, one restart: the file ends committed exactly once

use lrledger::crash_point::points;
use lrledger::ledger::LedgerStore;

use crate::crash::harness::{crash_then_restart, Workspace};

#[test]
fn test_every_crash_point_recovers_to_one_commit() {
    for point in points::all() {
        let workspace = Workspace::new();
        let file = workspace.write_batch("a.json", 4);

        let (_, restarted) = crash_then_restart(&workspace, &file, point);
        let state = restarted.state();
        assert!(state == "completed" || state == "skipped", "{}: {}", point, state);

        assert_eq!(workspace.highest_committed(), Some(4), "{}", point);
        let ledger = workspace.ledger();
        assert!(ledger.released_ranges().unwrap().is_empty(), "{}", point);
        assert!(ledger.failed_batches().unwrap().is_empty(), "{}", point);

        // A third run finds the content committed
        drop(ledger);
        assert_eq!(workspace.process(&file, None).state(), "skipped", "{}", point);
    }
}
