//! The Sentinel daemon: file-system monitor, submission gate, bounded work
//! pool, scan pipeline and the local control plane. `main.rs` is the
//! composition root; the modules here are exercised directly by the
//! integration tests.

pub mod control;
pub mod dispatch;
pub mod gate;
pub mod monitor;
pub mod pipeline;
