//! Unix process plumbing for long running supervisor daemons:
//! backgrounding with start/stop/status control, log capture with
//! rotation, lock files, and native process table access.

pub mod daemon;
pub mod fork;
pub mod lock;
pub mod logging;
pub mod proc_table;
pub mod signal;
pub mod state;
