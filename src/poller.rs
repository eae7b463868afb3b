use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::model::Commit;
use crate::provider::DataProvider;
use crate::queue::{Task, TaskQueue};

/// Sleep durations growing quadratically from `min` to `max` over `steps`
/// successive calls to [`next_delay`](Self::next_delay).
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    steps: u32,
    step: u32,
}

impl Backoff {
    /// Bounds given in the wrong order are swapped.
    pub fn new(min: Duration, max: Duration, steps: u32) -> Self {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        Self {
            min,
            max,
            steps: steps.max(1),
            step: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let alpha = f64::from(self.step) / f64::from(self.steps);
        let t = alpha * alpha;
        let delay = self.min.mul_f64(1.0 - t) + self.max.mul_f64(t);
        if self.step < self.steps {
            self.step += 1;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// Decides whether a fetched commit is queued for grading.
pub type AdmissionFilter = Arc<dyn Fn(&Commit) -> bool + Send + Sync>;

pub fn accept_all() -> AdmissionFilter {
    Arc::new(|_| true)
}

/// Feeds the backlog of queued commits to the workers, one batch at a time.
pub struct Poller {
    data: Arc<dyn DataProvider>,
    queue: Arc<TaskQueue>,
    filter: AdmissionFilter,
    backoff: Backoff,
}

impl Poller {
    pub fn new(
        data: Arc<dyn DataProvider>,
        queue: Arc<TaskQueue>,
        filter: AdmissionFilter,
        backoff: Backoff,
    ) -> Self {
        Self {
            data,
            queue,
            filter,
            backoff,
        }
    }

    /// Polls until `token` is cancelled.
    ///
    /// A batch is fully acknowledged by the workers before the next fetch,
    /// so a commit is never queued twice.
    pub async fn run(mut self, token: CancellationToken) {
        log::info!("Poller started");

        loop {
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = self.data.fetch_queued_commits() => fetched,
            };
            let commits: Vec<Commit> = match fetched {
                Ok(commits) => commits.into_iter().filter(|c| (self.filter)(c)).collect(),
                Err(e) => {
                    log::error!("Could not fetch queued commits: {e}");
                    Vec::new()
                }
            };

            if !commits.is_empty() {
                log::info!("Queueing {} commits", commits.len());
                for commit in commits {
                    self.queue.push(Task::Commit(Box::new(commit)));
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.queue.join() => {}
                }
                self.backoff.reset();
            }

            let delay = self.backoff.next_delay();
            log::debug!("Next poll in {} ms", delay.as_millis());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::info!("Poller stopped");
    }
}
