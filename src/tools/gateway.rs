//! 工具网关
//!
//! 持有多台工具服务器：能力目录按 TTL 缓存、调用施加超时、仅对瞬态失败在预算内重试。
//! 每台服务器有独立的并发信号量（独立故障域）——一台服务器故障或占满预算，
//! 不会阻塞对另一台的调用；每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;

use crate::config::GatewaySection;
use crate::core::OrchestrateError;
use crate::tools::{ToolCallRequest, ToolCallResult, ToolError, ToolServer, ToolSignature};

struct CachedCatalog {
    tools: Vec<ToolSignature>,
    fetched_at: Instant,
}

struct ServerHandle {
    server: Arc<dyn ToolServer>,
    /// 该服务器的并发调用预算，与其它服务器互不相干
    permits: Arc<Semaphore>,
    catalog: RwLock<Option<CachedCatalog>>,
}

/// 工具网关：server_id -> ServerHandle
pub struct ToolGateway {
    servers: HashMap<String, ServerHandle>,
    catalog_ttl: Duration,
    invoke_timeout: Duration,
    max_retries: usize,
    max_concurrent_calls: usize,
}

impl ToolGateway {
    pub fn new(cfg: &GatewaySection) -> Self {
        Self {
            servers: HashMap::new(),
            catalog_ttl: Duration::from_secs(cfg.catalog_ttl_secs),
            invoke_timeout: Duration::from_secs(cfg.invoke_timeout_secs),
            max_retries: cfg.max_retries,
            max_concurrent_calls: cfg.max_concurrent_calls,
        }
    }

    /// 注册一台服务器（启动期配置，注册后不再变更）
    pub fn register(&mut self, server: Arc<dyn ToolServer>) {
        let id = server.id().to_string();
        self.servers.insert(
            id,
            ServerHandle {
                server,
                permits: Arc::new(Semaphore::new(self.max_concurrent_calls.max(1))),
                catalog: RwLock::new(None),
            },
        );
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    fn handle(&self, server_id: &str) -> Result<&ServerHandle, OrchestrateError> {
        self.servers
            .get(server_id)
            .ok_or_else(|| OrchestrateError::UnknownToolServer(server_id.to_string()))
    }

    /// 能力目录：缓存命中且未过 TTL 直接返回，否则向服务器拉取并刷新缓存
    pub async fn list_capabilities(
        &self,
        server_id: &str,
    ) -> Result<Vec<ToolSignature>, OrchestrateError> {
        let handle = self.handle(server_id)?;
        {
            let cached = handle.catalog.read().await;
            if let Some(c) = cached.as_ref() {
                if c.fetched_at.elapsed() < self.catalog_ttl {
                    return Ok(c.tools.clone());
                }
            }
        }

        let tools = timeout(self.invoke_timeout, handle.server.list_tools())
            .await
            .map_err(|_| OrchestrateError::ToolTimeout(format!("{} catalog", server_id)))?
            .map_err(|e| map_tool_error(e))?;

        *handle.catalog.write().await = Some(CachedCatalog {
            tools: tools.clone(),
            fetched_at: Instant::now(),
        });
        Ok(tools)
    }

    /// 显式失效某服务器的目录缓存
    pub async fn invalidate(&self, server_id: &str) -> Result<(), OrchestrateError> {
        let handle = self.handle(server_id)?;
        *handle.catalog.write().await = None;
        Ok(())
    }

    /// 在已注册服务器中查找拥有某工具的服务器（必要时刷新目录）
    pub async fn resolve(&self, tool: &str) -> Result<String, OrchestrateError> {
        for server_id in self.servers.keys() {
            let tools = self.list_capabilities(server_id).await.unwrap_or_default();
            if tools.iter().any(|t| t.name == tool) {
                return Ok(server_id.clone());
            }
        }
        Err(OrchestrateError::UnknownTool(tool.to_string()))
    }

    /// 按工具名调用：先解析归属服务器再 invoke
    pub async fn invoke_named(
        &self,
        request: &ToolCallRequest,
    ) -> Result<ToolCallResult, OrchestrateError> {
        let server_id = self.resolve(&request.tool).await?;
        self.invoke(&server_id, request).await
    }

    /// 执行一次调用：获取该服务器的并发许可，超时按瞬态处理，
    /// 瞬态失败最多重试 max_retries 次，永久失败立即上抛
    pub async fn invoke(
        &self,
        server_id: &str,
        request: &ToolCallRequest,
    ) -> Result<ToolCallResult, OrchestrateError> {
        let handle = self.handle(server_id)?;
        let _permit = handle
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestrateError::InvalidState("gateway shut down".to_string()))?;

        let start = Instant::now();
        let mut attempt = 0;
        let result = loop {
            let outcome = timeout(self.invoke_timeout, handle.server.call(request)).await;
            match outcome {
                Ok(Ok(payload)) => {
                    break Ok(ToolCallResult {
                        tool: request.tool.clone(),
                        payload,
                    })
                }
                Ok(Err(ToolError::Permanent(reason))) => {
                    break Err(OrchestrateError::PermanentTool(reason))
                }
                Ok(Err(ToolError::Transient(reason))) => {
                    if attempt >= self.max_retries {
                        break Err(OrchestrateError::TransientTool(reason));
                    }
                }
                Err(_) => {
                    if attempt >= self.max_retries {
                        break Err(OrchestrateError::ToolTimeout(request.tool.clone()));
                    }
                }
            }
            attempt += 1;
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "server": server_id,
            "tool": request.tool,
            "ok": result.is_ok(),
            "attempts": attempt + 1,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

fn map_tool_error(e: ToolError) -> OrchestrateError {
    match e {
        ToolError::Transient(r) => OrchestrateError::TransientTool(r),
        ToolError::Permanent(r) => OrchestrateError::PermanentTool(r),
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyServer {
        id: String,
        calls: AtomicUsize,
        catalog_fetches: AtomicUsize,
        fail_first: usize,
        permanent: bool,
        delay: Option<Duration>,
    }

    impl FlakyServer {
        fn ok(id: &str) -> Self {
            Self {
                id: id.to_string(),
                calls: AtomicUsize::new(0),
                catalog_fetches: AtomicUsize::new(0),
                fail_first: 0,
                permanent: false,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl ToolServer for FlakyServer {
        fn id(&self) -> &str {
            &self.id
        }

        async fn list_tools(&self) -> Result<Vec<ToolSignature>, ToolError> {
            self.catalog_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ToolSignature {
                name: format!("{}_tool", self.id),
                description: "test tool".to_string(),
                parameters: serde_json::json!({}),
            }])
        }

        async fn call(&self, _request: &ToolCallRequest) -> Result<String, ToolError> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(ToolError::Permanent("bad arguments".to_string()));
            }
            if n < self.fail_first {
                return Err(ToolError::Transient("flaky".to_string()));
            }
            Ok("done".to_string())
        }
    }

    fn gateway_cfg() -> GatewaySection {
        GatewaySection {
            catalog_ttl_secs: 300,
            invoke_timeout_secs: 1,
            max_retries: 2,
            max_concurrent_calls: 2,
        }
    }

    fn req(tool: &str) -> ToolCallRequest {
        ToolCallRequest {
            tool: tool.to_string(),
            args: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_within_budget() {
        let server = Arc::new(FlakyServer {
            fail_first: 2,
            ..FlakyServer::ok("erp")
        });
        let mut gw = ToolGateway::new(&gateway_cfg());
        gw.register(server.clone());

        let result = gw.invoke("erp", &req("erp_tool")).await.unwrap();
        assert_eq!(result.payload, "done");
        assert_eq!(server.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_never_retried() {
        let server = Arc::new(FlakyServer {
            permanent: true,
            ..FlakyServer::ok("erp")
        });
        let mut gw = ToolGateway::new(&gateway_cfg());
        gw.register(server.clone());

        let err = gw.invoke("erp", &req("erp_tool")).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::PermanentTool(_)));
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_catalog_is_cached_within_ttl() {
        let server = Arc::new(FlakyServer::ok("gitea"));
        let mut gw = ToolGateway::new(&gateway_cfg());
        gw.register(server.clone());

        gw.list_capabilities("gitea").await.unwrap();
        gw.list_capabilities("gitea").await.unwrap();
        assert_eq!(server.catalog_fetches.load(Ordering::SeqCst), 1);

        gw.invalidate("gitea").await.unwrap();
        gw.list_capabilities("gitea").await.unwrap();
        assert_eq!(server.catalog_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_server_does_not_block_sibling_server() {
        let slow = Arc::new(FlakyServer {
            delay: Some(Duration::from_secs(5)),
            ..FlakyServer::ok("slow")
        });
        let fast = Arc::new(FlakyServer::ok("fast"));
        let mut gw = ToolGateway::new(&GatewaySection {
            max_retries: 0,
            ..gateway_cfg()
        });
        gw.register(slow);
        gw.register(fast);
        let gw = Arc::new(gw);

        let gw2 = Arc::clone(&gw);
        let slow_call = tokio::spawn(async move { gw2.invoke("slow", &req("slow_tool")).await });
        let fast_result = gw.invoke("fast", &req("fast_tool")).await;

        assert!(fast_result.is_ok());
        assert!(matches!(
            slow_call.await.unwrap().unwrap_err(),
            OrchestrateError::ToolTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_resolve_finds_owning_server() {
        let mut gw = ToolGateway::new(&gateway_cfg());
        gw.register(Arc::new(FlakyServer::ok("erp")));
        gw.register(Arc::new(FlakyServer::ok("gitea")));

        assert_eq!(gw.resolve("gitea_tool").await.unwrap(), "gitea");
        assert!(matches!(
            gw.resolve("nope").await.unwrap_err(),
            OrchestrateError::UnknownTool(_)
        ));
    }
}
