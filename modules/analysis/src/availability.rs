use owl_core::{ApiRequest, Result, Transport};
use serde_json::{json, Map, Value};

/// Status the service uses for "no matching job".
pub const NOT_AVAILABLE: &str = "not_available";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub fingerprint: String,
    pub analyzers: Vec<String>,
    /// Also match jobs that already finished; otherwise only running ones.
    pub include_reported: bool,
    /// How far back to look; `None` means no limit.
    pub minutes_ago: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// A matching job exists; reuse it instead of submitting.
    Available { job_id: u64, status: String },
    NotAvailable,
}

impl Availability {
    pub fn job_id(&self) -> Option<u64> {
        match self {
            Availability::Available { job_id, .. } => Some(*job_id),
            Availability::NotAvailable => None,
        }
    }
}

fn request_body(q: &AvailabilityQuery) -> Value {
    let mut body = Map::new();
    body.insert("md5".into(), json!(q.fingerprint));
    body.insert("analyzers".into(), json!(q.analyzers));
    if !q.include_reported {
        body.insert("running_only".into(), json!(true));
    }
    if let Some(m) = q.minutes_ago {
        body.insert("minutes_ago".into(), json!(m));
    }
    Value::Object(body)
}

/// Accepts ids sent either as numbers or as numeric strings.
pub(crate) fn as_job_id(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Asks the service whether a job for this fingerprint and analyzer set
/// already exists.
pub async fn check_availability<T: Transport + ?Sized>(
    transport: &T,
    query: &AvailabilityQuery,
) -> Result<Availability> {
    let req = ApiRequest::post("ask_analysis_availability", "api/ask_analysis_availability")
        .target(format!("md5 {}", query.fingerprint))
        .json(request_body(query));
    let ctx = req.context();
    let resp = transport.execute(req).await?.error_for_status(&ctx)?;
    let answer: Value = resp.json(&ctx)?;

    let status = match answer.get("status").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return Err(ctx.protocol(format!("result without status: {answer}"))),
    };
    if status == NOT_AVAILABLE {
        tracing::debug!(fingerprint = %query.fingerprint, "no matching analysis");
        return Ok(Availability::NotAvailable);
    }
    match answer.get("job_id").and_then(as_job_id) {
        Some(job_id) => Ok(Availability::Available { job_id, status }),
        None => Err(ctx.protocol(format!("status '{status}' without job_id: {answer}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::mock::MockTransport;
    use owl_core::{ClientError, Method, RequestBody};

    fn query(include_reported: bool, minutes_ago: Option<u32>) -> AvailabilityQuery {
        AvailabilityQuery {
            fingerprint: "5ababd603b22780302dd8d83498e5172".into(),
            analyzers: vec!["Classic_DNS".into()],
            include_reported,
            minutes_ago,
        }
    }

    #[tokio::test]
    async fn existing_job_is_returned_unchanged() {
        let mock = MockTransport::new().respond(200, json!({"status": "running", "job_id": 7}));
        let got = check_availability(&mock, &query(true, None)).await.unwrap();
        assert_eq!(got, Availability::Available { job_id: 7, status: "running".into() });
        assert_eq!(mock.calls_to(Method::Post, "api/ask_analysis_availability"), 1);
    }

    #[tokio::test]
    async fn not_available_needs_no_job_id() {
        let mock = MockTransport::new().respond(200, json!({"status": "not_available"}));
        let got = check_availability(&mock, &query(false, None)).await.unwrap();
        assert_eq!(got, Availability::NotAvailable);
        assert_eq!(got.job_id(), None);
    }

    #[tokio::test]
    async fn missing_status_is_a_protocol_error() {
        let mock = MockTransport::new().respond(200, json!({"job_id": 7}));
        let err = check_availability(&mock, &query(true, None)).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol { .. }));
    }

    #[tokio::test]
    async fn missing_job_id_is_a_protocol_error() {
        let mock = MockTransport::new().respond(200, json!({"status": "running"}));
        let err = check_availability(&mock, &query(true, None)).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol { .. }));
    }

    #[tokio::test]
    async fn http_failure_is_a_request_failure() {
        let mock = MockTransport::new().respond(401, json!({"detail": "Invalid token."}));
        let err = check_availability(&mock, &query(true, None)).await.unwrap_err();
        assert!(err.is_request_failure());
        assert!(err.to_string().contains("Invalid token."));
    }

    #[tokio::test]
    async fn body_reflects_recency_and_running_only() {
        let mock = MockTransport::new()
            .respond(200, json!({"status": "not_available"}))
            .respond(200, json!({"status": "not_available"}));
        check_availability(&mock, &query(false, Some(60))).await.unwrap();
        check_availability(&mock, &query(true, None)).await.unwrap();
        let reqs = mock.requests();
        assert_eq!(
            reqs[0].body,
            RequestBody::Json(json!({
                "md5": "5ababd603b22780302dd8d83498e5172",
                "analyzers": ["Classic_DNS"],
                "running_only": true,
                "minutes_ago": 60
            }))
        );
        assert_eq!(
            reqs[1].body,
            RequestBody::Json(json!({
                "md5": "5ababd603b22780302dd8d83498e5172",
                "analyzers": ["Classic_DNS"]
            }))
        );
    }

    #[test]
    fn job_ids_accept_numeric_strings() {
        assert_eq!(as_job_id(&json!(12)), Some(12));
        assert_eq!(as_job_id(&json!("12")), Some(12));
        assert_eq!(as_job_id(&json!(null)), None);
        assert_eq!(as_job_id(&json!(-1)), None);
    }
}
