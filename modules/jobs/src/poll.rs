//! Waiting for a job to reach a terminal state.
//!
//! Polling is read-only, so abandoning it between attempts never leaves the
//! remote job in a different state than letting it run out would.

use owl_core::{ClientError, Job, Result, Transport};
use std::time::Duration;
use tokio::sync::watch;

use crate::query::get_job;

pub const DEFAULT_MAX_TRIES: u32 = 5;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_tries: u32,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings { max_tries: DEFAULT_MAX_TRIES, interval: DEFAULT_INTERVAL }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEnd {
    /// The job reached a terminal status.
    Terminal,
    /// Attempts ran out first; the job is whatever was last seen.
    Exhausted,
    /// Stopped between attempts on request.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub job: Job,
    pub attempts: u32,
    pub end: PollEnd,
}

impl PollOutcome {
    pub fn finished(&self) -> bool {
        self.end == PollEnd::Terminal
    }
}

/// Sending half of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half, checked by the poller between attempts.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx: Some(rx) })
}

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        Cancellation { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancelled; pends forever for `never()` or when every
    /// handle was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

/// Polls `job_id` until it is terminal or `settings.max_tries` fetches have
/// been made. Running out of attempts is not an error.
pub async fn poll_job<T: Transport + ?Sized>(
    transport: &T,
    job_id: u64,
    settings: PollSettings,
) -> Result<PollOutcome> {
    poll_job_until(transport, job_id, settings, &mut Cancellation::never()).await
}

/// Like [`poll_job`], but stops early when `cancel` fires. A fetch that is
/// already in flight is allowed to finish; the cancellation takes effect
/// before the next sleep or during it.
pub async fn poll_job_until<T: Transport + ?Sized>(
    transport: &T,
    job_id: u64,
    settings: PollSettings,
    cancel: &mut Cancellation,
) -> Result<PollOutcome> {
    if settings.max_tries == 0 {
        return Err(ClientError::Validation("max_tries must be at least 1".into()));
    }
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let job = get_job(transport, job_id).await?;
        tracing::debug!(job_id, attempt, status = %job.status, "polled job");
        if job.status.is_terminal() {
            tracing::info!(job_id, attempts = attempt, status = %job.status, "job finished");
            return Ok(PollOutcome { job, attempts: attempt, end: PollEnd::Terminal });
        }
        if attempt >= settings.max_tries {
            tracing::warn!(
                job_id,
                attempts = attempt,
                status = %job.status,
                "job still not finished, giving up polling"
            );
            return Ok(PollOutcome { job, attempts: attempt, end: PollEnd::Exhausted });
        }
        if cancel.is_cancelled() {
            return Ok(cancelled(job, attempt));
        }
        tokio::select! {
            _ = tokio::time::sleep(settings.interval) => {}
            _ = cancel.cancelled() => return Ok(cancelled(job, attempt)),
        }
    }
}

fn cancelled(job: Job, attempts: u32) -> PollOutcome {
    tracing::info!(job_id = job.id, attempts, "polling cancelled");
    PollOutcome { job, attempts, end: PollEnd::Cancelled }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::mock::MockTransport;
    use owl_core::JobStatus;
    use serde_json::json;

    fn fast(max_tries: u32) -> PollSettings {
        PollSettings { max_tries, interval: Duration::ZERO }
    }

    fn job(status: &str) -> serde_json::Value {
        json!({"id": 7, "status": status})
    }

    #[tokio::test]
    async fn stops_at_first_terminal_status() {
        let mock = MockTransport::new()
            .respond(200, job("pending"))
            .respond(200, job("running"))
            .respond(200, job("reported_without_fails"))
            .respond(200, job("reported_without_fails"));
        let out = poll_job(&mock, 7, fast(5)).await.unwrap();
        assert_eq!(mock.calls(), 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(out.end, PollEnd::Terminal);
        assert_eq!(out.job.status, JobStatus::ReportedWithoutFails);
        assert!(out.finished());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_one_interval_between_fetches() {
        let interval = Duration::from_secs(5);
        let mock = MockTransport::new()
            .respond(200, job("pending"))
            .respond(200, job("running"))
            .respond(200, job("reported_without_fails"));
        let start = tokio::time::Instant::now();
        let out = poll_job(&mock, 7, PollSettings { max_tries: 5, interval }).await.unwrap();
        assert_eq!(out.attempts, 3);
        assert_eq!(start.elapsed(), interval * 2);

        // no sleep before the first fetch or after the last one
        let mock = MockTransport::new().respond(200, job("killed"));
        let start = tokio::time::Instant::now();
        poll_job(&mock, 7, PollSettings { max_tries: 5, interval }).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        let mock = MockTransport::new()
            .respond(200, job("running"))
            .respond(200, job("running"))
            .respond(200, job("running"));
        let start = tokio::time::Instant::now();
        let out = poll_job(&mock, 7, PollSettings { max_tries: 3, interval }).await.unwrap();
        assert_eq!(out.end, PollEnd::Exhausted);
        assert_eq!(start.elapsed(), interval * 2);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_job() {
        let mock = MockTransport::new()
            .respond(200, job("running"))
            .respond(200, job("running"))
            .respond(200, job("reported_with_fails"));
        let out = poll_job(&mock, 7, fast(2)).await.unwrap();
        assert_eq!(mock.calls(), 2);
        assert_eq!(out.end, PollEnd::Exhausted);
        assert_eq!(out.job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn every_terminal_status_stops_polling() {
        for status in ["reported_with_fails", "failed", "killed"] {
            let mock = MockTransport::new().respond(200, job(status)).respond(200, job(status));
            let out = poll_job(&mock, 7, fast(5)).await.unwrap();
            assert_eq!(mock.calls(), 1, "{status}");
            assert!(out.job.status.is_terminal());
        }
    }

    #[tokio::test]
    async fn fetch_failure_surfaces_immediately() {
        let mock = MockTransport::new()
            .respond(200, job("running"))
            .respond(500, json!({"detail": "boom"}))
            .respond(200, job("failed"));
        let err = poll_job(&mock, 7, fast(5)).await.unwrap_err();
        assert!(err.is_request_failure());
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn zero_tries_is_rejected_without_fetching() {
        let mock = MockTransport::new();
        let err = poll_job(&mock, 7, fast(0)).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_between_attempts() {
        let mock = MockTransport::new().respond(200, job("running")).respond(200, job("running"));
        let (handle, mut cancel) = cancellation();
        handle.cancel();
        let out = poll_job_until(&mock, 7, fast(5), &mut cancel).await.unwrap();
        assert_eq!(mock.calls(), 1);
        assert_eq!(out.end, PollEnd::Cancelled);
        assert_eq!(out.job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let mock = MockTransport::new().respond(200, job("pending"));
        let (handle, mut cancel) = cancellation();
        let settings = PollSettings { max_tries: 3, interval: Duration::from_secs(3600) };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let (out, _) = tokio::join!(poll_job_until(&mock, 7, settings, &mut cancel), canceller);
        let out = out.unwrap();
        assert_eq!(out.end, PollEnd::Cancelled);
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn never_is_not_cancelled() {
        assert!(!Cancellation::never().is_cancelled());
        let (handle, cancel) = cancellation();
        assert!(!cancel.is_cancelled());
        handle.cancel();
        assert!(cancel.is_cancelled());
    }
}
