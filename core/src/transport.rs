//! The seam between operations and the wire.
//!
//! Operations build an [`ApiRequest`], hand it to a [`Transport`] and turn
//! the raw [`ApiResponse`] into typed results. A transport reports every
//! answered request as `Ok`, whatever the status; only failures to get an
//! answer at all are errors at this layer.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub content: Vec<u8>,
}

/// Multipart body: repeated text fields are allowed and sent in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub files: Vec<FilePart>,
}

impl MultipartForm {
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn texts<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for v in values {
            self.fields.push((name.to_string(), v.into()));
        }
        self
    }

    pub fn file(
        mut self,
        field: impl Into<String>,
        filename: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        self.files.push(FilePart { field: field.into(), filename: filename.into(), content });
        self
    }

    /// All values sent under `name`, in order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.fields.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

/// Operation name and target identifier, kept for error messages once the
/// request itself has been handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub operation: &'static str,
    pub target: String,
}

impl RequestContext {
    pub fn failed(&self, status: Option<u16>, detail: impl Into<String>) -> ClientError {
        ClientError::RequestFailed {
            operation: self.operation,
            target: self.target.clone(),
            status,
            detail: detail.into(),
        }
    }

    pub fn protocol(&self, detail: impl Into<String>) -> ClientError {
        ClientError::Protocol {
            operation: self.operation,
            target: self.target.clone(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub operation: &'static str,
    pub target: String,
    pub method: Method,
    /// Path relative to the instance URL, without a leading slash.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(operation: &'static str, method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        ApiRequest {
            operation,
            target: path.clone(),
            method,
            path,
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(operation: &'static str, path: impl Into<String>) -> Self {
        Self::new(operation, Method::Get, path)
    }

    pub fn post(operation: &'static str, path: impl Into<String>) -> Self {
        Self::new(operation, Method::Post, path)
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }

    pub fn context(&self) -> RequestContext {
        RequestContext { operation: self.operation, target: self.target.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        ApiResponse { status, body: body.into() }
    }

    pub fn json_body(status: u16, body: &Value) -> Self {
        ApiResponse { status, body: body.to_string().into_bytes() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Server-provided explanation: the `detail` key of a JSON body when it
    /// has one, the whole JSON document otherwise, or the raw text.
    pub fn detail(&self) -> String {
        match serde_json::from_slice::<Value>(&self.body) {
            Ok(Value::Object(map)) => match map.get("detail") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => Value::Object(map).to_string(),
            },
            Ok(other) => other.to_string(),
            Err(_) => String::from_utf8_lossy(&self.body).trim().to_string(),
        }
    }

    /// Turns any non-2xx answer into `RequestFailed` with the server detail.
    pub fn error_for_status(self, ctx: &RequestContext) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let detail = self.detail();
            Err(ctx.failed(Some(self.status), detail))
        }
    }

    pub fn json<T: DeserializeOwned>(&self, ctx: &RequestContext) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ctx.protocol(format!("malformed response body: {e}")))
    }
}

/// Sends requests to the analysis service. One instance is owned by one
/// workflow at a time; operations call it strictly sequentially.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for &T {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        (**self).execute(request).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        (**self).execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        ApiRequest::get("get_job", "api/jobs/7").target("job #7").context()
    }

    #[test]
    fn detail_prefers_the_detail_key() {
        let resp = ApiResponse::json_body(404, &json!({"detail": "Not found."}));
        assert_eq!(resp.detail(), "Not found.");
        let resp = ApiResponse::json_body(400, &json!({"errors": {"tlp": ["bad"]}}));
        assert_eq!(resp.detail(), r#"{"errors":{"tlp":["bad"]}}"#);
        let resp = ApiResponse::new(502, "Bad Gateway\n");
        assert_eq!(resp.detail(), "Bad Gateway");
    }

    #[test]
    fn error_for_status_keeps_context() {
        let err = ApiResponse::json_body(404, &json!({"detail": "Not found."}))
            .error_for_status(&ctx())
            .unwrap_err();
        match err {
            ClientError::RequestFailed { operation, target, status, detail } => {
                assert_eq!(operation, "get_job");
                assert_eq!(target, "job #7");
                assert_eq!(status, Some(404));
                assert_eq!(detail, "Not found.");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ApiResponse::new(204, "").error_for_status(&ctx()).is_ok());
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let err = ApiResponse::new(200, "<html>").json::<Value>(&ctx()).unwrap_err();
        assert!(matches!(err, ClientError::Protocol { .. }));
    }

    #[test]
    fn multipart_keeps_repeated_fields_in_order() {
        let form = MultipartForm::default()
            .text("file_name", "a.bin")
            .texts("analyzers_requested", ["Yara", "ClamAV"])
            .file("file", "a.bin", vec![1, 2, 3]);
        assert_eq!(form.values("analyzers_requested"), vec!["Yara", "ClamAV"]);
        assert_eq!(form.files[0].content, vec![1, 2, 3]);
    }
}
