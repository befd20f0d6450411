// src/context.rs
use crate::job::{JobId, JobRecord};
use crate::transitions::Transitions;
use crate::Result;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::Span;

/// Application context containing shared resources
pub trait AppContext: AsAny + Send + Sync + 'static {
    /// Clone the context for use in another thread
    fn clone_context(&self) -> Arc<dyn AppContext>;
}

/// Context provided to job execution
pub struct JobContext {
    pub job_id: JobId,
    pub job: JobRecord,
    pub app_context: Arc<dyn AppContext>,
    pub span: Span,
    conn: ConnectionManager,
    transitions: Arc<Transitions>,
}

impl JobContext {
    pub(crate) fn new(
        job: JobRecord,
        app_context: Arc<dyn AppContext>,
        conn: ConnectionManager,
        transitions: Arc<Transitions>,
    ) -> Self {
        let span = tracing::info_span!(
            "job_execution",
            job_id = %job.id,
            job_name = %job.name,
        );

        Self {
            job_id: job.id.clone(),
            job,
            app_context,
            span,
            conn,
            transitions,
        }
    }

    /// Get typed app context
    pub fn app<T: AppContext>(&self) -> Option<&T> {
        self.app_context.as_ref().as_any().downcast_ref::<T>()
    }

    /// Attempt number of the current run, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    /// Records progress on the job hash and publishes a `progress` event.
    pub async fn update_progress(&self, progress: serde_json::Value) -> Result<()> {
        let mut conn = self.conn.clone();
        self.transitions
            .update_progress(&mut conn, &self.job_id, &progress)
            .await
    }
}

// Helper trait for downcasting
pub trait AsAny {
    fn as_any(&self) -> &dyn std::any::Any;
}

impl<T: AppContext> AsAny for T {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
