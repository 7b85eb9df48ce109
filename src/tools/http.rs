//! HTTP JSON 工具服务器客户端
//!
//! 约定两个端点：GET {base}/tools 返回签名数组，POST {base}/call 接收
//! {"tool": ..., "args": ...} 并返回 {"result": "..."}。
//! 超时与 5xx 归为 Transient，4xx 归为 Permanent。

use async_trait::async_trait;
use serde::Deserialize;

use crate::tools::{ToolCallRequest, ToolError, ToolServer, ToolSignature};

/// 基于 reqwest 的远程工具服务器
pub struct HttpToolServer {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CallResponse {
    result: String,
}

impl HttpToolServer {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn classify(e: reqwest::Error) -> ToolError {
        if e.is_timeout() || e.is_connect() {
            return ToolError::Transient(e.to_string());
        }
        match e.status() {
            Some(s) if s.is_server_error() => ToolError::Transient(e.to_string()),
            Some(_) => ToolError::Permanent(e.to_string()),
            None => ToolError::Transient(e.to_string()),
        }
    }
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolSignature>, ToolError> {
        let resp = self
            .client
            .get(format!("{}/tools", self.base_url))
            .send()
            .await
            .map_err(Self::classify)?
            .error_for_status()
            .map_err(Self::classify)?;
        resp.json::<Vec<ToolSignature>>()
            .await
            .map_err(|e| ToolError::Permanent(format!("bad catalog payload: {}", e)))
    }

    async fn call(&self, request: &ToolCallRequest) -> Result<String, ToolError> {
        let resp = self
            .client
            .post(format!("{}/call", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(Self::classify)?
            .error_for_status()
            .map_err(Self::classify)?;
        let body: CallResponse = resp
            .json()
            .await
            .map_err(|e| ToolError::Permanent(format!("bad call payload: {}", e)))?;
        Ok(body.result)
    }
}
