//! Building and sending new-analysis requests.

use owl_core::{
    ApiRequest, ApiResponse, ClientError, MultipartForm, RequestContext, Result, Tlp, Transport,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::availability::as_job_id;

/// Status of a submission the service queued.
pub const ACCEPTED: &str = "accepted";

/// Options shared by every submission variant. Empty plugin lists mean
/// "let the server pick".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOptions {
    pub tlp: Option<Tlp>,
    pub analyzers: Vec<String>,
    pub connectors: Vec<String>,
    pub tags: Vec<String>,
    pub runtime_config: Map<String, Value>,
}

impl AnalysisOptions {
    fn tlp_or_default(&self) -> Tlp {
        self.tlp.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservableRequest {
    pub name: String,
    /// Overrides detection when set; must name a known classification.
    pub classification: Option<String>,
    pub options: AnalysisOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRequest {
    pub filename: String,
    pub content: Vec<u8>,
    pub options: AnalysisOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisRequest {
    Observable(ObservableRequest),
    File(FileRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionResult {
    pub job_id: u64,
    pub status: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub analyzers_running: Vec<String>,
    pub connectors_running: Vec<String>,
}

impl SubmissionResult {
    pub fn is_accepted(&self) -> bool {
        self.status == ACCEPTED
    }
}

/// Flattens whatever shape the server used for warnings/errors (string,
/// list, field -> messages map) into plain messages.
fn messages(v: Option<&Value>) -> Vec<String> {
    fn walk(prefix: Option<&str>, v: &Value, out: &mut Vec<String>) {
        match v {
            Value::Null => {}
            Value::String(s) if s.is_empty() => {}
            Value::String(s) => out.push(match prefix {
                Some(p) => format!("{p}: {s}"),
                None => s.clone(),
            }),
            Value::Array(items) => items.iter().for_each(|i| walk(prefix, i, out)),
            Value::Object(map) => map.iter().for_each(|(k, i)| walk(Some(k.as_str()), i, out)),
            other => out.push(other.to_string()),
        }
    }
    let mut out = Vec::new();
    if let Some(v) = v {
        walk(None, v, &mut out);
    }
    out
}

fn strings(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn mentions_filtering(resp: &ApiResponse) -> bool {
    String::from_utf8_lossy(&resp.body).to_lowercase().contains("after filtering")
}

/// Interprets a submission answer. Any non-2xx status or non-empty `errors`
/// is a failure even when the body otherwise looks like a job.
fn read_submission(
    ctx: &RequestContext,
    resp: ApiResponse,
    playbook: bool,
) -> Result<SubmissionResult> {
    let mut answer: Value = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);
    if playbook {
        // only single-target playbook submissions are sent
        let first = answer.get("results").and_then(Value::as_array).and_then(|r| r.first());
        if let Some(first) = first {
            answer = first.clone();
        }
    }
    let errors = messages(answer.get("errors"));
    if !resp.is_success() || !errors.is_empty() {
        let detail = if errors.is_empty() { resp.detail() } else { errors.join("; ") };
        if mentions_filtering(&resp) {
            return Err(ClientError::NoRunnableAnalyzers {
                operation: ctx.operation,
                target: ctx.target.clone(),
                detail,
            });
        }
        return Err(ctx.failed(Some(resp.status), detail));
    }

    let status = match answer.get("status").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return Err(ctx.protocol(format!("submission result without status: {answer}"))),
    };
    let job_id = answer
        .get("job_id")
        .and_then(as_job_id)
        .ok_or_else(|| ctx.protocol(format!("submission result without job_id: {answer}")))?;
    let result = SubmissionResult {
        job_id,
        status,
        warnings: messages(answer.get("warnings")),
        errors,
        analyzers_running: strings(answer.get("analyzers_running")),
        connectors_running: strings(answer.get("connectors_running")),
    };
    tracing::info!(
        job_id = result.job_id,
        status = %result.status,
        warnings = result.warnings.len(),
        operation = ctx.operation,
        "new job submitted"
    );
    for w in &result.warnings {
        tracing::warn!(job_id = result.job_id, warning = %w, "server warning");
    }
    Ok(result)
}

async fn send<T: Transport + ?Sized>(
    transport: &T,
    req: ApiRequest,
    playbook: bool,
) -> Result<SubmissionResult> {
    let ctx = req.context();
    let resp = transport.execute(req).await?;
    read_submission(&ctx, resp, playbook)
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ClientError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

pub async fn submit_observable<T: Transport + ?Sized>(
    transport: &T,
    req: ObservableRequest,
) -> Result<SubmissionResult> {
    require("observable name", &req.name)?;
    let classification = classify::resolve(&req.name, req.classification.as_deref())?;
    let target = format!("{classification} {}", req.name);
    let o = req.options;
    let body = json!({
        "observable_name": req.name,
        "observable_classification": classification,
        "analyzers_requested": o.analyzers,
        "connectors_requested": o.connectors,
        "tlp": o.tlp_or_default(),
        "tags_labels": o.tags,
        "runtime_configuration": o.runtime_config,
    });
    let api = ApiRequest::post("analyze_observable", "api/analyze_observable")
        .target(target)
        .json(body);
    send(transport, api, false).await
}

pub async fn submit_file<T: Transport + ?Sized>(
    transport: &T,
    req: FileRequest,
) -> Result<SubmissionResult> {
    require("file name", &req.filename)?;
    let o = req.options;
    let mut form = MultipartForm::default()
        .text("file_name", req.filename.clone())
        .texts("analyzers_requested", o.analyzers.iter().cloned())
        .texts("connectors_requested", o.connectors.iter().cloned())
        .text("tlp", o.tlp_or_default().as_str())
        .texts("tags_labels", o.tags.iter().cloned());
    if !o.runtime_config.is_empty() {
        form = form.text("runtime_configuration", Value::Object(o.runtime_config).to_string());
    }
    form = form.file("file", req.filename.clone(), req.content);
    let api = ApiRequest::post("analyze_file", "api/analyze_file")
        .target(format!("file {}", req.filename))
        .multipart(form);
    send(transport, api, false).await
}

pub async fn submit<T: Transport + ?Sized>(
    transport: &T,
    req: AnalysisRequest,
) -> Result<SubmissionResult> {
    match req {
        AnalysisRequest::Observable(r) => submit_observable(transport, r).await,
        AnalysisRequest::File(r) => submit_file(transport, r).await,
    }
}

/// Playbook variant: the playbook picks the plugins, so analyzer and
/// connector lists are ignored and TLP is only sent when given.
pub async fn submit_observable_playbook<T: Transport + ?Sized>(
    transport: &T,
    req: ObservableRequest,
    playbook: &str,
) -> Result<SubmissionResult> {
    require("observable name", &req.name)?;
    require("playbook", playbook)?;
    let classification = classify::resolve(&req.name, req.classification.as_deref())?;
    let target = format!("{classification} {} via playbook {playbook}", req.name);
    let o = req.options;
    let mut body = json!({
        "observables": [[classification, req.name]],
        "playbook_requested": playbook,
        "tags_labels": o.tags,
        "runtime_configuration": o.runtime_config,
    });
    if let (Some(tlp), Value::Object(map)) = (o.tlp, &mut body) {
        map.insert("tlp".into(), json!(tlp));
    }
    let path = "api/playbook/analyze_multiple_observables";
    let api = ApiRequest::post("analyze_multiple_observables", path)
        .target(target)
        .json(body);
    send(transport, api, true).await
}

pub async fn submit_file_playbook<T: Transport + ?Sized>(
    transport: &T,
    req: FileRequest,
    playbook: &str,
) -> Result<SubmissionResult> {
    require("file name", &req.filename)?;
    require("playbook", playbook)?;
    let o = req.options;
    let mut form = MultipartForm::default()
        .text("playbook_requested", playbook)
        .texts("tags_labels", o.tags.iter().cloned());
    if let Some(tlp) = o.tlp {
        form = form.text("tlp", tlp.as_str());
    }
    if !o.runtime_config.is_empty() {
        form = form.text("runtime_configuration", Value::Object(o.runtime_config).to_string());
    }
    form = form.file("files", req.filename.clone(), req.content);
    let api = ApiRequest::post("analyze_multiple_files", "api/playbook/analyze_multiple_files")
        .target(format!("file {} via playbook {playbook}", req.filename))
        .multipart(form);
    send(transport, api, true).await
}

pub async fn submit_playbook<T: Transport + ?Sized>(
    transport: &T,
    req: AnalysisRequest,
    playbook: &str,
) -> Result<SubmissionResult> {
    match req {
        AnalysisRequest::Observable(r) => submit_observable_playbook(transport, r, playbook).await,
        AnalysisRequest::File(r) => submit_file_playbook(transport, r, playbook).await,
    }
}
