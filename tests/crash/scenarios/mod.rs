//! Crash scenarios, grouped by the component hosting the crash point

mod commit;
mod ledger;
mod reservation;
mod sweep;
