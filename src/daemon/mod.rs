//! Daemon subsystem: the supervisor process's signal handling. The
//! single-instance PID-file lifecycle lives in [`crate::store::lock`]
//! alongside per-run advisory locks, since both are the same `fs2`-based
//! primitive.

pub mod signals;
