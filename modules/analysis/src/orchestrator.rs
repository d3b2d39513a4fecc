//! The end-to-end "analyse" workflow: reuse an existing job when one
//! matches, otherwise submit, and optionally wait for the result.

use jobs::{poll_job_until, Cancellation, PollOutcome, PollSettings};
use owl_core::{ClientError, Result, Transport};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::availability::{check_availability, Availability, AvailabilityQuery};
use crate::batch::BatchRow;
use crate::submit::{
    self, AnalysisOptions, AnalysisRequest, FileRequest, ObservableRequest, SubmissionResult,
};

/// How hard to look for an existing job before submitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckMode {
    /// Reuse running or already reported jobs.
    #[default]
    Reported,
    /// Reuse running jobs only.
    Running,
    /// Always submit.
    ForceNew,
}

impl FromStr for CheckMode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reported" => Ok(CheckMode::Reported),
            "running" => Ok(CheckMode::Running),
            "force-new" | "force_new" => Ok(CheckMode::ForceNew),
            other => Err(ClientError::Validation(format!(
                "unknown check mode '{other}' (expected reported, running or force-new)"
            ))),
        }
    }
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckMode::Reported => "reported",
            CheckMode::Running => "running",
            CheckMode::ForceNew => "force-new",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Observable,
    /// `target` is a path to a local file.
    File,
}

impl FromStr for TargetKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observable" => Ok(TargetKind::Observable),
            "file" => Ok(TargetKind::File),
            other => Err(ClientError::Validation(format!(
                "unknown target type '{other}' (expected observable or file)"
            ))),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetKind::Observable => "observable",
            TargetKind::File => "file",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyseRequest {
    pub target: String,
    pub kind: TargetKind,
    pub check: CheckMode,
    pub classification: Option<String>,
    pub options: AnalysisOptions,
    /// Submit through this playbook instead of an explicit plugin list.
    pub playbook: Option<String>,
    pub should_poll: bool,
    pub minutes_ago: Option<u32>,
}

impl AnalyseRequest {
    pub fn observable(value: impl Into<String>) -> Self {
        Self::new(value.into(), TargetKind::Observable)
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(path.into(), TargetKind::File)
    }

    fn new(target: String, kind: TargetKind) -> Self {
        AnalyseRequest {
            target,
            kind,
            check: CheckMode::default(),
            classification: None,
            options: AnalysisOptions::default(),
            playbook: None,
            should_poll: false,
            minutes_ago: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyseOutcome {
    /// A matching job already existed; nothing was submitted.
    Existing { job_id: u64, status: String },
    Submitted {
        submission: SubmissionResult,
        /// Present when polling was requested and the job was accepted.
        poll: Option<PollOutcome>,
    },
}

impl AnalyseOutcome {
    pub fn job_id(&self) -> u64 {
        match self {
            AnalyseOutcome::Existing { job_id, .. } => *job_id,
            AnalyseOutcome::Submitted { submission, .. } => submission.job_id,
        }
    }
}

#[derive(Debug)]
pub struct BatchEntry {
    /// 1-based position in the input.
    pub row: usize,
    pub value: String,
    pub result: Result<AnalyseOutcome>,
}

/// Runs analyses against one transport. Holds no state between calls
/// beyond its settings.
pub struct Analyser<'a, T: Transport + ?Sized> {
    transport: &'a T,
    poll: PollSettings,
    cancel: Cancellation,
}

impl<'a, T: Transport + ?Sized> Analyser<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Analyser { transport, poll: PollSettings::default(), cancel: Cancellation::never() }
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn analyse(&self, req: AnalyseRequest) -> Result<AnalyseOutcome> {
        let plugins =
            |names: &[String]| if names.is_empty() { "all".to_string() } else { names.join(",") };
        tracing::info!(
            kind = %req.kind,
            target = %req.target,
            analyzers = %plugins(&req.options.analyzers),
            connectors = %plugins(&req.options.connectors),
            playbook = req.playbook.as_deref().unwrap_or("-"),
            "requesting analysis"
        );

        let request = match req.kind {
            TargetKind::Observable => AnalysisRequest::Observable(ObservableRequest {
                name: req.target.clone(),
                classification: req.classification.clone(),
                options: req.options,
            }),
            TargetKind::File => {
                let path = Path::new(&req.target);
                let content = fingerprint::read_file(path)?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| req.target.clone());
                AnalysisRequest::File(FileRequest { filename, content, options: req.options })
            }
        };

        // Playbooks choose their own plugins, so there is no set to match on.
        if req.playbook.is_none() && req.check != CheckMode::ForceNew {
            let (fingerprint, analyzers) = match &request {
                AnalysisRequest::Observable(o) => {
                    (fingerprint::observable_fingerprint(&o.name), &o.options.analyzers)
                }
                AnalysisRequest::File(f) => {
                    (fingerprint::binary_fingerprint(&f.content), &f.options.analyzers)
                }
            };
            let query = AvailabilityQuery {
                fingerprint,
                analyzers: analyzers.clone(),
                include_reported: req.check == CheckMode::Reported,
                minutes_ago: req.minutes_ago,
            };
            let found = check_availability(self.transport, &query).await?;
            if let Availability::Available { job_id, status } = found {
                tracing::info!(
                    job_id,
                    %status,
                    "found existing analysis; use check mode force-new to analyse anyway"
                );
                return Ok(AnalyseOutcome::Existing { job_id, status });
            }
        }

        let submission = match &req.playbook {
            Some(playbook) => submit::submit_playbook(self.transport, request, playbook).await?,
            None => submit::submit(self.transport, request).await?,
        };

        if !req.should_poll {
            return Ok(AnalyseOutcome::Submitted { submission, poll: None });
        }
        if !submission.is_accepted() {
            tracing::error!(
                job_id = submission.job_id,
                status = %submission.status,
                "can't poll a job that was not accepted"
            );
            return Ok(AnalyseOutcome::Submitted { submission, poll: None });
        }
        let mut cancel = self.cancel.clone();
        let outcome =
            poll_job_until(self.transport, submission.job_id, self.poll, &mut cancel).await?;
        tracing::info!(
            job_id = submission.job_id,
            status = %outcome.job.status,
            "polling finished; run `owlctl jobs view {}` to see the result",
            submission.job_id
        );
        Ok(AnalyseOutcome::Submitted { submission, poll: Some(outcome) })
    }

    /// Analyses each row in turn. A failing row is logged and recorded but
    /// never stops the rows after it; only cancellation does.
    pub async fn analyse_batch(&self, rows: Vec<BatchRow>) -> Vec<BatchEntry> {
        let total = rows.len();
        let mut out = Vec::with_capacity(total);
        for (i, row) in rows.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(skipped = total - i, "batch cancelled");
                break;
            }
            let value = row.value.clone();
            let result = match row.into_request() {
                Ok(req) => self.analyse(req).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::error!(row = i + 1, value = %value, error = %e, "batch row failed");
            }
            out.push(BatchEntry { row: i + 1, value, result });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs::PollEnd;
    use owl_core::mock::MockTransport;
    use owl_core::{JobStatus, Method, RequestBody};
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    fn fast() -> PollSettings {
        PollSettings { max_tries: 5, interval: Duration::ZERO }
    }

    fn accepted(job_id: u64) -> serde_json::Value {
        json!({"job_id": job_id, "status": "accepted", "warnings": [], "errors": []})
    }

    #[tokio::test]
    async fn existing_job_short_circuits_submission() {
        let mock = MockTransport::new()
            .respond(200, json!({"status": "reported_without_fails", "job_id": 42}));
        let req = AnalyseRequest::observable("example.com");
        let outcome = Analyser::new(&mock).analyse(req).await.unwrap();
        assert_eq!(
            outcome,
            AnalyseOutcome::Existing { job_id: 42, status: "reported_without_fails".into() }
        );
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.calls_to(Method::Post, "api/analyze_observable"), 0);
        // reported mode searches finished jobs too
        let RequestBody::Json(body) = &mock.requests()[0].body else {
            panic!("expected json body")
        };
        assert_eq!(body["md5"], "5ababd603b22780302dd8d83498e5172");
        assert!(body.get("running_only").is_none());
    }

    #[tokio::test]
    async fn running_mode_restricts_the_search() {
        let mock = MockTransport::new()
            .respond(200, json!({"status": "not_available"}))
            .respond(200, accepted(3));
        let mut req = AnalyseRequest::observable("EXAMPLE.com");
        req.check = CheckMode::Running;
        req.minutes_ago = Some(30);
        let outcome = Analyser::new(&mock).analyse(req).await.unwrap();
        assert_eq!(outcome.job_id(), 3);
        let RequestBody::Json(body) = &mock.requests()[0].body else {
            panic!("expected json body")
        };
        assert_eq!(body["running_only"], true);
        assert_eq!(body["minutes_ago"], 30);
        assert_eq!(body["md5"], "5ababd603b22780302dd8d83498e5172");
    }

    #[tokio::test]
    async fn force_new_skips_the_check_and_polls() {
        let mock = MockTransport::new()
            .respond(200, accepted(9))
            .respond(200, json!({"id": 9, "status": "running"}))
            .respond(200, json!({"id": 9, "status": "reported_with_fails"}));
        let mut req = AnalyseRequest::observable("8.8.8.8");
        req.check = CheckMode::ForceNew;
        req.should_poll = true;
        let outcome = Analyser::new(&mock).with_poll_settings(fast()).analyse(req).await.unwrap();
        assert_eq!(mock.calls_to(Method::Post, "api/ask_analysis_availability"), 0);
        assert_eq!(mock.calls_to(Method::Get, "api/jobs/9"), 2);
        match outcome {
            AnalyseOutcome::Submitted { submission, poll: Some(poll) } => {
                assert_eq!(submission.job_id, 9);
                assert_eq!(poll.end, PollEnd::Terminal);
                assert_eq!(poll.job.status, JobStatus::ReportedWithFails);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unaccepted_submission_is_not_polled() {
        let mock = MockTransport::new()
            .respond(200, json!({"job_id": 4, "status": "failed", "errors": []}));
        let mut req = AnalyseRequest::observable("8.8.8.8");
        req.check = CheckMode::ForceNew;
        req.should_poll = true;
        let outcome = Analyser::new(&mock).with_poll_settings(fast()).analyse(req).await.unwrap();
        assert_eq!(mock.calls(), 1);
        assert!(matches!(outcome, AnalyseOutcome::Submitted { poll: None, .. }));
    }

    #[tokio::test]
    async fn file_target_fingerprints_content_and_uploads_it() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello").unwrap();
        let mock = MockTransport::new()
            .respond(200, json!({"status": "not_available"}))
            .respond(200, accepted(12));
        let req = AnalyseRequest::file(f.path().to_string_lossy().into_owned());
        Analyser::new(&mock).analyse(req).await.unwrap();
        let reqs = mock.requests();
        let RequestBody::Json(body) = &reqs[0].body else { panic!("expected json body") };
        assert_eq!(body["md5"], "5d41402abc4b2a76b9719d911017c592");
        let RequestBody::Multipart(form) = &reqs[1].body else { panic!("expected multipart body") };
        assert_eq!(form.files[0].content, b"hello".to_vec());
        let expected_name = f.path().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(form.values("file_name"), vec![expected_name.as_str()]);
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_request() {
        let mock = MockTransport::new();
        let req = AnalyseRequest::file("/no/such/file.bin");
        let err = Analyser::new(&mock).analyse(req).await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound { .. }));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn playbook_skips_availability() {
        let mock = MockTransport::new().respond(200, json!({"results": [accepted(30)]}));
        let mut req = AnalyseRequest::observable("1.1.1.1");
        req.playbook = Some("FREE_TO_USE_ANALYZERS".into());
        let outcome = Analyser::new(&mock).analyse(req).await.unwrap();
        assert_eq!(outcome.job_id(), 30);
        assert_eq!(mock.calls_to(Method::Post, "api/playbook/analyze_multiple_observables"), 1);
        assert_eq!(mock.calls(), 1);
    }

    fn row(value: &str) -> BatchRow {
        BatchRow {
            value: value.into(),
            kind: "observable".into(),
            check: Some("force-new".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn batch_isolates_failing_rows() {
        let mock = MockTransport::new()
            .respond(200, accepted(1))
            .respond(500, json!({"detail": "Internal Server Error"}))
            .respond(200, accepted(3));
        let rows =
            vec![row("example.com"), row("8.8.8.8"), row("d41d8cd98f00b204e9800998ecf8427e")];
        let entries = Analyser::new(&mock).analyse_batch(rows).await;
        assert_eq!(mock.calls_to(Method::Post, "api/analyze_observable"), 3);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].result.as_ref().unwrap().job_id(), 1);
        let err = entries[1].result.as_ref().unwrap_err();
        assert!(err.is_request_failure());
        assert_eq!(entries[1].value, "8.8.8.8");
        assert_eq!(entries[2].result.as_ref().unwrap().job_id(), 3);
    }

    #[tokio::test]
    async fn batch_row_conversion_errors_are_isolated_too() {
        let mock = MockTransport::new().respond(200, accepted(2));
        let mut bad = row("example.com");
        bad.kind = "directory".into();
        let entries = Analyser::new(&mock).analyse_batch(vec![bad, row("example.org")]).await;
        assert!(matches!(entries[0].result, Err(ClientError::Validation(_))));
        assert_eq!(entries[1].result.as_ref().unwrap().job_id(), 2);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_batch_stops_submitting() {
        let mock = MockTransport::new().respond(200, accepted(1));
        let (handle, cancel) = jobs::cancellation();
        handle.cancel();
        let entries = Analyser::new(&mock)
            .with_cancellation(cancel)
            .analyse_batch(vec![row("example.com")])
            .await;
        assert!(entries.is_empty());
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn check_modes_parse() {
        assert_eq!("force-new".parse::<CheckMode>().unwrap(), CheckMode::ForceNew);
        assert_eq!("Running".parse::<CheckMode>().unwrap(), CheckMode::Running);
        assert!("sometimes".parse::<CheckMode>().is_err());
        assert_eq!(CheckMode::default(), CheckMode::Reported);
    }
}
