//! Submitting things for analysis: the availability check, raw submission
//! of observables and files, and the workflow that ties them to polling.

pub mod availability;
pub mod batch;
pub mod orchestrator;
pub mod submit;

pub use availability::{check_availability, Availability, AvailabilityQuery};
pub use batch::{load_rows, load_runtime_config, parse_rows, BatchRow};
pub use orchestrator::{
    AnalyseOutcome, AnalyseRequest, Analyser, BatchEntry, CheckMode, TargetKind,
};
pub use submit::{
    submit, submit_file, submit_file_playbook, submit_observable, submit_observable_playbook,
    submit_playbook, AnalysisOptions, AnalysisRequest, FileRequest, ObservableRequest,
    SubmissionResult,
};
