//! Wrapper: the thin process launched by the submission script in place of
//! the workload. Validates the node, starts a liveness beacon, runs the
//! workload, and reports its outcome through the run directory's failure
//! taxonomy.

pub mod beacon_thread;
pub mod probes;
pub mod run;

pub use run::{run_wrapper, WrapperArgs};
