//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use shepherd::prelude::*;
//! ```

pub use crate::core::config::Config;
pub use crate::core::errors::{Result, ShepherdError};
pub use crate::core::paths::StateLayout;

pub use crate::model::{
    Blacklist, ConfigOverrides, RunControl, RunEnded, RunFailure, RunFinal, RunMeta, RunStatus,
};

pub use crate::scheduler::{CompletedJob, JobState, SlurmAdapter};
pub use crate::status::{compute_status, StatusInputs};
pub use crate::supervisor::Supervisor;
