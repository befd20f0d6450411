// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchyardError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    MissingJob(String),

    #[error("lock for job {0} is missing or held by another worker")]
    LockLost(String),

    #[error("job {0} is not in the expected state")]
    WrongState(String),

    #[error("job {0} has pending dependencies")]
    PendingDependencies(String),

    #[error("queue must be paused before it can be obliterated")]
    QueueNotPaused,

    #[error("queue still has active jobs")]
    ActiveJobs,

    #[error("job execution failed: {0}")]
    JobExecution(#[from] anyhow::Error),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("unexpected script reply: {0}")]
    Script(String),
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;

impl SwitchyardError {
    /// Decodes the shared negative return-code convention used by the
    /// transition scripts: -1 missing key, -2 missing/bad lock, -3 wrong
    /// state, -4 pending dependencies.
    pub(crate) fn from_code(code: i64, job_id: &str) -> SwitchyardError {
        match code {
            -1 => SwitchyardError::MissingJob(job_id.to_string()),
            -2 => SwitchyardError::LockLost(job_id.to_string()),
            -3 => SwitchyardError::WrongState(job_id.to_string()),
            -4 => SwitchyardError::PendingDependencies(job_id.to_string()),
            other => {
                SwitchyardError::Script(format!("unknown return code {} for job {}", other, job_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_typed_errors() {
        assert!(matches!(
            SwitchyardError::from_code(-1, "1"),
            SwitchyardError::MissingJob(_)
        ));
        assert!(matches!(
            SwitchyardError::from_code(-2, "1"),
            SwitchyardError::LockLost(_)
        ));
        assert!(matches!(
            SwitchyardError::from_code(-3, "1"),
            SwitchyardError::WrongState(_)
        ));
        assert!(matches!(
            SwitchyardError::from_code(-4, "1"),
            SwitchyardError::PendingDependencies(_)
        ));
        assert!(matches!(
            SwitchyardError::from_code(-9, "1"),
            SwitchyardError::Script(_)
        ));
    }
}
