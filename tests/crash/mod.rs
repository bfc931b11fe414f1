//! Crash testing infrastructure
//!
//! `harness` drives the `lrledger` binary in a throwaway data directory;
//! `scenarios` groups the crash points by the component that hosts them.

pub mod harness;

mod scenarios;
