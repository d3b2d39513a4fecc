//! Job-level operations: reading job state, waiting for a job to finish and
//! acting on a job or one of its plugins.

pub mod actions;
pub mod poll;
pub mod query;

pub use actions::{delete_job, kill_job, kill_plugin, retry_plugin, PluginAction};
pub use poll::{
    cancellation, poll_job, poll_job_until, CancelHandle, Cancellation, PollEnd, PollOutcome,
    PollSettings,
};
pub use query::{download_sample, get_job, list_jobs, JobListQuery};
