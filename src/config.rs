//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `QUORUM__*` 覆盖（双下划线表示嵌套，
//! 如 `QUORUM__ROUTER__SPECIALIST_TIMEOUT_SECS=45`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub router: RouterSection,
}

/// [app] 段：应用名、记忆持久化根目录、事件窗口
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话日志与事实存储的持久化目录，未设置时纯内存运行
    pub persist_root: Option<PathBuf>,
    /// 每会话事件环形缓冲窗口（条）
    #[serde(default = "default_event_window")]
    pub event_window: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            persist_root: None,
            event_window: default_event_window(),
        }
    }
}

fn default_event_window() -> usize {
    1024
}

/// [llm] 段：后端选择与模型名
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；无 API Key 时自动降级为 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [gateway] 段：工具网关的目录缓存 TTL、调用超时、重试与并发预算
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// 能力目录缓存 TTL（秒）
    #[serde(default = "default_catalog_ttl_secs")]
    pub catalog_ttl_secs: u64,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
    /// 瞬态失败最大重试次数（不含首次调用）
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// 每个工具服务器的并发调用预算（独立信号量，互不阻塞）
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            catalog_ttl_secs: default_catalog_ttl_secs(),
            invoke_timeout_secs: default_invoke_timeout_secs(),
            max_retries: default_max_retries(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

fn default_catalog_ttl_secs() -> u64 {
    300
}

fn default_invoke_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    2
}

fn default_max_concurrent_calls() -> usize {
    4
}

/// [router] 段：委派路由器的各项上限
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// 单次智能体调用内最大工具往返轮数
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// 单个专家调用超时（秒），超时按该专家失败处理，不影响兄弟专家
    #[serde(default = "default_specialist_timeout_secs")]
    pub specialist_timeout_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            specialist_timeout_secs: default_specialist_timeout_secs(),
        }
    }
}

fn default_max_tool_rounds() -> usize {
    8
}

fn default_specialist_timeout_secs() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            gateway: GatewaySection::default(),
            router: RouterSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 QUORUM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 QUORUM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("QUORUM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.gateway.max_retries, 2);
        assert_eq!(cfg.router.max_tool_rounds, 8);
        assert_eq!(cfg.app.event_window, 1024);
        assert!(cfg.app.persist_root.is_none());
        // 手写 Default 必须与 serde 缺省函数一致
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
        assert_eq!(cfg.router.specialist_timeout_secs, 60);
    }
}
