use owl_core::{ApiRequest, Method, PluginKind, Result, Transport};
use std::fmt;

/// Status the service answers with when it accepted an action.
const ACCEPTED: u16 = 204;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    Kill,
    Retry,
}

impl PluginAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginAction::Kill => "kill",
            PluginAction::Retry => "retry",
        }
    }
}

impl fmt::Display for PluginAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends one action request. `Ok(true)` only for the accepted status; any
/// other 2xx is `Ok(false)` and non-2xx answers are errors carrying the
/// server detail. The resulting state change is not awaited.
async fn dispatch<T: Transport + ?Sized>(transport: &T, req: ApiRequest) -> Result<bool> {
    let ctx = req.context();
    let resp = transport.execute(req).await?.error_for_status(&ctx)?;
    let accepted = resp.status == ACCEPTED;
    if !accepted {
        tracing::warn!(
            operation = ctx.operation,
            target = %ctx.target,
            status = resp.status,
            "action not accepted"
        );
    }
    Ok(accepted)
}

pub async fn kill_job<T: Transport + ?Sized>(transport: &T, job_id: u64) -> Result<bool> {
    let req = ApiRequest::new("kill_job", Method::Patch, format!("api/jobs/{job_id}/kill"))
        .target(format!("job #{job_id}"));
    dispatch(transport, req).await
}

pub async fn delete_job<T: Transport + ?Sized>(transport: &T, job_id: u64) -> Result<bool> {
    let req = ApiRequest::new("delete_job", Method::Delete, format!("api/jobs/{job_id}"))
        .target(format!("job #{job_id}"));
    dispatch(transport, req).await
}

async fn plugin_action<T: Transport + ?Sized>(
    transport: &T,
    job_id: u64,
    kind: PluginKind,
    name: &str,
    action: PluginAction,
) -> Result<bool> {
    let operation = match action {
        PluginAction::Kill => "kill_plugin",
        PluginAction::Retry => "retry_plugin",
    };
    let path = format!("api/jobs/{job_id}/{kind}/{name}/{action}");
    let req = ApiRequest::new(operation, Method::Patch, path)
        .target(format!("job #{job_id} {kind} {name}"));
    dispatch(transport, req).await
}

pub async fn kill_plugin<T: Transport + ?Sized>(
    transport: &T,
    job_id: u64,
    kind: PluginKind,
    name: &str,
) -> Result<bool> {
    plugin_action(transport, job_id, kind, name, PluginAction::Kill).await
}

pub async fn retry_plugin<T: Transport + ?Sized>(
    transport: &T,
    job_id: u64,
    kind: PluginKind,
    name: &str,
) -> Result<bool> {
    plugin_action(transport, job_id, kind, name, PluginAction::Retry).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::mock::MockTransport;
    use serde_json::json;

    #[tokio::test]
    async fn job_actions_hit_the_right_endpoints() {
        let mock = MockTransport::new().respond_raw(204, "").respond_raw(204, "");
        assert!(kill_job(&mock, 4).await.unwrap());
        assert!(delete_job(&mock, 4).await.unwrap());
        assert_eq!(mock.calls_to(Method::Patch, "api/jobs/4/kill"), 1);
        assert_eq!(mock.calls_to(Method::Delete, "api/jobs/4"), 1);
    }

    #[tokio::test]
    async fn plugin_actions_build_paths_from_kind_and_name() {
        let mock = MockTransport::new().respond_raw(204, "").respond_raw(204, "");
        assert!(kill_plugin(&mock, 9, PluginKind::Analyzer, "Shodan").await.unwrap());
        assert!(retry_plugin(&mock, 9, PluginKind::Connector, "MISP").await.unwrap());
        assert_eq!(mock.calls_to(Method::Patch, "api/jobs/9/analyzer/Shodan/kill"), 1);
        assert_eq!(mock.calls_to(Method::Patch, "api/jobs/9/connector/MISP/retry"), 1);
    }

    #[tokio::test]
    async fn other_success_codes_are_not_acceptance() {
        let mock = MockTransport::new().respond(200, json!({"status": "ok"}));
        assert!(!kill_job(&mock, 4).await.unwrap());
    }

    #[tokio::test]
    async fn refused_actions_are_errors_with_detail() {
        let mock = MockTransport::new().respond(400, json!({"detail": "Job is not running"}));
        let err = kill_job(&mock, 4).await.unwrap_err();
        assert!(err.is_request_failure());
        assert!(err.to_string().contains("Job is not running"));
        assert!(err.to_string().contains("kill_job (job #4)"));
    }
}
