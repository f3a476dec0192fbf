//! Scripted transport shared by the client and retry tests.

use super::transport::{ApiRequest, ApiResponse, HttpTransport, TransportError};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Replays a fixed list of outcomes and records every request it receives.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<ApiResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("script exhausted".to_string())))
    }
}

pub fn status_response(status: u16) -> ApiResponse {
    ApiResponse {
        status,
        retry_after: None,
        body: String::new(),
    }
}

pub fn json_response(status: u16, body: Value) -> ApiResponse {
    ApiResponse {
        status,
        retry_after: None,
        body: body.to_string(),
    }
}

pub fn rate_limited(retry_after_secs: u64) -> ApiResponse {
    ApiResponse {
        status: 429,
        retry_after: Some(Duration::from_secs(retry_after_secs)),
        body: String::new(),
    }
}

pub fn text_response(status: u16, body: &str) -> ApiResponse {
    ApiResponse {
        status,
        retry_after: None,
        body: body.to_string(),
    }
}
