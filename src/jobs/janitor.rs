//! Periodic cache auto-cleanup

use std::sync::Arc;

use log::debug;

use super::coordinator::{JobKind, WorkerCoordinator, WorkerError};
use crate::cache::TwoTierCache;

/// Run [`TwoTierCache::cleanup_expired`] every `cleanup_interval` as the
/// `cache-cleanup` job. Stopping the job interrupts the sleep between passes.
pub fn spawn_cache_janitor(
    coordinator: &WorkerCoordinator,
    cache: Arc<TwoTierCache>,
) -> Result<u64, WorkerError> {
    let interval = cache.config().cleanup_interval;

    coordinator.start_job(JobKind::CACHE_CLEANUP, move |ctx| {
        let mut passes = 0usize;
        let mut removed = 0usize;

        while !ctx.wait(interval) {
            let report = cache.cleanup_expired();
            passes += 1;
            removed += report.total();
            debug!("Cleanup pass {passes} removed {} entries", report.total());
        }

        Ok(format!("{passes} cleanup passes removed {removed} entries"))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{CacheConfig, CacheEvent};
    use crate::jobs::{JobState, JobUpdate};

    #[test]
    fn janitor_runs_until_stopped() {
        let cache = Arc::new(TwoTierCache::new(CacheConfig {
            memory_ttl: Duration::ZERO,
            cleanup_interval: Duration::from_millis(10),
            ..CacheConfig::default()
        }));
        let events = cache.subscribe();
        cache.put("k", "v", false);

        let coordinator = WorkerCoordinator::default();
        spawn_cache_janitor(&coordinator, Arc::clone(&cache)).unwrap();

        let first = events
            .recv_timeout(Duration::from_secs(2))
            .expect("cleanup pass");
        assert!(matches!(first, CacheEvent::CleanedUp(_)));

        coordinator.stop_job(&JobKind::CACHE_CLEANUP).unwrap();
        assert_eq!(
            coordinator.job_state(&JobKind::CACHE_CLEANUP),
            JobState::Idle
        );
        assert!(cache.is_empty());
        assert!(
            coordinator
                .poll_events()
                .iter()
                .any(|e| matches!(e.update, JobUpdate::Succeeded(_)))
        );
    }
}
