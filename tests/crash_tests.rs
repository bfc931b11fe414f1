//! Crash tests for lrledger
//!
//! - Every scenario runs the real binary with `LRLEDGER_CRASH_POINT` set
//! - The aborted run leaves whatever reached the disk; a second run without
//!   the variable must finish the file without reusing or losing numbers
//! - Real filesystem (no mocks)

mod crash;
