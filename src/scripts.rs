// src/scripts.rs - atomic transition scripts
//!
//! Every multi-key state change is a single server-side script so that no
//! client failure can leave a job in two sets. Scripts are embedded at
//! compile time and sent by SHA after the first invocation; variants for
//! legacy servers are chosen once at load time, not per call.

use crate::client::ServerVersion;
use redis::Script;

pub struct Scripts {
    pub add_job: Script,
    pub move_to_active: Script,
    pub extend_lock: Script,
    pub move_to_finished: Script,
    pub move_to_delayed: Script,
    pub move_to_waiting_children: Script,
    pub promote: Script,
    pub update_delay_set: Script,
    pub pause: Script,
    pub retry_job: Script,
    pub reprocess_job: Script,
    pub remove_job: Script,
    pub clean_jobs_in_set: Script,
    pub obliterate: Script,
    pub drain: Script,
    pub move_stalled_jobs_to_wait: Script,
    pub get_state: Script,
    pub update_progress: Script,
}

impl Scripts {
    pub fn new(version: ServerVersion) -> Self {
        let get_state = if version.supports_lpos() {
            Script::new(include_str!("./lua/get_state_v2.lua"))
        } else {
            Script::new(include_str!("./lua/get_state.lua"))
        };

        Self {
            add_job: Script::new(include_str!("./lua/add_job.lua")),
            move_to_active: Script::new(include_str!("./lua/move_to_active.lua")),
            extend_lock: Script::new(include_str!("./lua/extend_lock.lua")),
            move_to_finished: Script::new(include_str!("./lua/move_to_finished.lua")),
            move_to_delayed: Script::new(include_str!("./lua/move_to_delayed.lua")),
            move_to_waiting_children: Script::new(include_str!(
                "./lua/move_to_waiting_children.lua"
            )),
            promote: Script::new(include_str!("./lua/promote.lua")),
            update_delay_set: Script::new(include_str!("./lua/update_delay_set.lua")),
            pause: Script::new(include_str!("./lua/pause.lua")),
            retry_job: Script::new(include_str!("./lua/retry_job.lua")),
            reprocess_job: Script::new(include_str!("./lua/reprocess_job.lua")),
            remove_job: Script::new(include_str!("./lua/remove_job.lua")),
            clean_jobs_in_set: Script::new(include_str!("./lua/clean_jobs_in_set.lua")),
            obliterate: Script::new(include_str!("./lua/obliterate.lua")),
            drain: Script::new(include_str!("./lua/drain.lua")),
            move_stalled_jobs_to_wait: Script::new(include_str!(
                "./lua/move_stalled_jobs_to_wait.lua"
            )),
            get_state,
            update_progress: Script::new(include_str!("./lua/update_progress.lua")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_servers_get_the_scanning_state_script() {
        let legacy = Scripts::new(ServerVersion(5, 0, 0));
        let modern = Scripts::new(ServerVersion(7, 2, 0));
        assert_ne!(legacy.get_state.get_hash(), modern.get_state.get_hash());
    }
}
