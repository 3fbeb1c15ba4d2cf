//! Supervisor Loop: the daemon's process model. `tick` is called once per
//! poll interval; it batches a single `squeue` call across every live run,
//! then dispatches each run through the per-run state machine in
//! [`run_step`].

pub mod run_step;
pub mod script_wrap;

use std::collections::HashMap;

use crate::blacklist;
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::core::paths::StateLayout;
use crate::logging::EventLog;
use crate::model::Blacklist;
use crate::scheduler::SlurmAdapter;
use crate::store::atomic::{read_json, write_json_atomic};
use crate::store::lock::RunLock;

/// Everything one `tick` needs: layout, policy, the scheduler adapter, and
/// a place to record operational events.
pub struct Supervisor {
    pub layout: StateLayout,
    pub config: Config,
    pub scheduler: SlurmAdapter,
    pub event_log: EventLog,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let layout = StateLayout::new(config.state_dir.clone());
        let event_log = EventLog::new(layout.root().join("events.jsonl"));
        let scheduler = SlurmAdapter::new(config.scheduler.clone());
        Self { layout, config, scheduler, event_log }
    }

    /// Enumerate runs, batch-query their job states, then handle each run
    /// whose advisory lock is uncontended. Runs under lock contention (e.g.
    /// a concurrent CLI mutation) are skipped this tick, not retried
    /// in-process — the next tick picks them up.
    pub fn tick(&self, now: i64) -> Result<()> {
        self.layout.ensure_dirs().map_err(|e| crate::core::errors::ShepherdError::io(self.layout.root(), e))?;

        let run_ids = self
            .layout
            .list_runs()
            .map_err(|e| crate::core::errors::ShepherdError::io(self.layout.runs_dir(), e))?;

        let job_ids = self.collect_job_ids(&run_ids);
        let live: HashMap<String, crate::scheduler::SlurmQueueEntry> = self
            .scheduler
            .list_live(Some(&job_ids))
            .into_iter()
            .map(|entry| (entry.job_id.clone(), entry))
            .collect();

        let mut quarantine: Blacklist =
            read_json(&self.layout.blacklist_path()).present().unwrap_or_default();
        blacklist::prune_expired(&mut quarantine, now);

        let mut quarantine_dirty = false;
        for run_id in &run_ids {
            let Some(lock) = RunLock::try_acquire(&self.layout.lock_file(run_id)).unwrap_or(None)
            else {
                continue;
            };
            let outcome = run_step::handle_run(self, run_id, &live, &mut quarantine, now);
            if let Ok(changed) = outcome {
                quarantine_dirty |= changed;
            }
            drop(lock);
        }

        if quarantine_dirty {
            let _ = write_json_atomic(&self.layout.blacklist_path(), &quarantine);
        }
        Ok(())
    }

    fn collect_job_ids(&self, run_ids: &[String]) -> Vec<String> {
        run_ids
            .iter()
            .filter_map(|run_id| {
                let meta: crate::model::RunMeta =
                    read_json(&self.layout.run_file(run_id, "meta.json")).present()?;
                meta.job_id
            })
            .collect()
    }
}
