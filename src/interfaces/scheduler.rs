use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Periodic work driven by [`crate::scheduler::Scheduler`]. A job never overlaps itself: the
/// next tick waits for the previous `run` to return.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;

    /// `false` delays the first run by one interval.
    fn run_at_start(&self) -> bool {
        true
    }

    async fn run(&self) -> Result<()>;
}
