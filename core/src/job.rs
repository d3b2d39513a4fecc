//! Job records as returned by the jobs endpoints.
//!
//! The server schema has grown over time, so every field except `id` and
//! `status` is optional and unknown keys are kept in `extra` rather than
//! rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    pub label: String,
    #[serde(default)]
    pub color: String,
}

/// One analyzer or connector run inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginReport {
    #[serde(alias = "analyzer_name", alias = "connector_name")]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub report: Value,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

impl PluginReport {
    /// Treats a report as successful when the server says so either way it
    /// has historically said it.
    pub fn succeeded(&self) -> bool {
        match (self.success, self.status.as_deref()) {
            (Some(ok), _) => ok,
            (None, Some(status)) => status.eq_ignore_ascii_case("success"),
            (None, None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub status: JobStatus,
    #[serde(default)]
    pub is_sample: bool,
    #[serde(default)]
    pub observable_name: Option<String>,
    #[serde(default)]
    pub observable_classification: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_mimetype: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub tlp: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub received_request_time: Option<String>,
    #[serde(default)]
    pub finished_analysis_time: Option<String>,
    #[serde(default)]
    pub process_time: Option<f64>,
    #[serde(default, alias = "analysis_reports")]
    pub analyzer_reports: Vec<PluginReport>,
    #[serde(default)]
    pub connector_reports: Vec<PluginReport>,
    #[serde(default)]
    pub warnings: Vec<Value>,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Observable value or file name, whichever the job was created for.
    pub fn target_name(&self) -> &str {
        self.observable_name
            .as_deref()
            .or(self.file_name.as_deref())
            .unwrap_or("")
    }

    /// Observable classification, or the file MIME type for samples.
    pub fn target_kind(&self) -> &str {
        self.observable_classification
            .as_deref()
            .or(self.file_mimetype.as_deref())
            .unwrap_or("")
    }

    /// Who submitted the job; newer servers nest a user object, older ones
    /// send a flat `source` string.
    pub fn owner(&self) -> Option<String> {
        match &self.user {
            Some(Value::Object(u)) => u.get("username").and_then(Value::as_str).map(str::to_string),
            Some(Value::String(s)) => Some(s.clone()),
            _ => self.source.clone(),
        }
    }
}

/// One page of `GET /api/jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub total_pages: u64,
    #[serde(default)]
    pub results: Vec<Job>,
}

/// Either a paginated envelope or the bare array older servers return.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum JobListing {
    Page(JobPage),
    Bare(Vec<Job>),
}

impl From<JobListing> for JobPage {
    fn from(listing: JobListing) -> Self {
        match listing {
            JobListing::Page(page) => page,
            JobListing::Bare(results) => JobPage {
                count: results.len() as u64,
                total_pages: 1,
                results,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_and_rich_jobs() {
        let job: Job = serde_json::from_value(json!({"id": 3, "status": "pending"})).unwrap();
        assert_eq!(job.id, 3);
        assert!(job.analyzer_reports.is_empty());

        let job: Job = serde_json::from_value(json!({
            "id": 7,
            "status": "reported_with_fails",
            "observable_name": "example.com",
            "observable_classification": "domain",
            "md5": "5ababd603b22780302dd8d83498e5172",
            "tags": [{"id": 1, "label": "phishing", "color": "#ff0000"}],
            "user": {"username": "analyst"},
            "analysis_reports": [
                {
                    "name": "Classic_DNS",
                    "success": true,
                    "report": {"resolutions": []},
                    "errors": []
                },
                {"name": "Shodan", "status": "FAILED", "report": {}, "errors": ["no key"]}
            ],
            "playbook_to_execute": null
        }))
        .unwrap();
        assert_eq!(job.target_name(), "example.com");
        assert_eq!(job.target_kind(), "domain");
        assert_eq!(job.owner().as_deref(), Some("analyst"));
        assert_eq!(job.analyzer_reports.len(), 2);
        assert!(job.analyzer_reports[0].succeeded());
        assert!(!job.analyzer_reports[1].succeeded());
        assert!(job.extra.contains_key("playbook_to_execute"));
    }

    #[test]
    fn file_job_falls_back_to_file_fields() {
        let job: Job = serde_json::from_value(json!({
            "id": 9,
            "status": "running",
            "is_sample": true,
            "file_name": "invoice.pdf",
            "file_mimetype": "application/pdf",
            "source": "legacy-user"
        }))
        .unwrap();
        assert_eq!(job.target_name(), "invoice.pdf");
        assert_eq!(job.target_kind(), "application/pdf");
        assert_eq!(job.owner().as_deref(), Some("legacy-user"));
    }

    #[test]
    fn listing_accepts_bare_arrays() {
        let bare = json!([{"id": 1, "status": "failed"}, {"id": 2, "status": "killed"}]);
        let listing: JobListing = serde_json::from_value(bare).unwrap();
        let page = JobPage::from(listing);
        assert_eq!(page.count, 2);
        assert_eq!(page.total_pages, 1);

        let paged =
            json!({"count": 40, "total_pages": 4, "results": [{"id": 1, "status": "running"}]});
        let listing: JobListing = serde_json::from_value(paged).unwrap();
        let page = JobPage::from(listing);
        assert_eq!(page.total_pages, 4);
        assert_eq!(page.results[0].status, JobStatus::Running);
    }
}
