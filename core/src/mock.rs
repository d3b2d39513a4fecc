//! Scripted transport for tests: answers requests from a queue and records
//! everything it was asked to send.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::Result;
use crate::transport::{ApiRequest, ApiResponse, Method, Transport};

enum Scripted {
    Respond(ApiResponse),
    Fail { status: Option<u16>, detail: String },
}

#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, status: u16, body: Value) -> Self {
        self.push(Scripted::Respond(ApiResponse::json_body(status, &body)))
    }

    pub fn respond_raw(self, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.push(Scripted::Respond(ApiResponse::new(status, body)))
    }

    /// Simulates a request that never got an answer (connection refused,
    /// timeout, ...).
    pub fn fail(self, detail: &str) -> Self {
        self.push(Scripted::Fail { status: None, detail: detail.to_string() })
    }

    fn push(self, item: Scripted) -> Self {
        self.script.lock().unwrap_or_else(|p| p.into_inner()).push_back(item);
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        self.requests().iter().filter(|r| r.method == method && r.path == path).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let ctx = request.context();
        let path = request.path.clone();
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).push(request);
        let next = self.script.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        match next {
            Some(Scripted::Respond(resp)) => Ok(resp),
            Some(Scripted::Fail { status, detail }) => Err(ctx.failed(status, detail)),
            None => {
                Err(ctx.failed(None, format!("mock transport has no scripted response for {path}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn answers_in_order_and_records_requests() {
        let mock = MockTransport::new().respond(200, json!({"a": 1})).fail("connection refused");
        let first = mock.execute(ApiRequest::get("one", "api/one")).await.unwrap();
        assert_eq!(first.status, 200);
        let second = mock.execute(ApiRequest::get("two", "api/two")).await.unwrap_err();
        assert!(second.to_string().contains("connection refused"));
        let third = mock.execute(ApiRequest::get("three", "api/three")).await;
        assert!(third.is_err());
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.calls_to(Method::Get, "api/two"), 1);
    }
}
