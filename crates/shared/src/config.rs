//! 配置管理模块
//!
//! 支持多层配置文件加载和环境变量覆盖，各服务在此之上定义自己的配置结构。

use config::{Config, Environment, File};

pub use config::ConfigError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "LOCALE_RULES";

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    /// 退出时写出 Prometheus 文本格式指标的路径
    pub metrics_path: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_path: None,
        }
    }
}

impl ObservabilityConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 当前运行环境（`LOCALE_RULES_ENV`，默认 development）
pub fn environment() -> String {
    std::env::var(format!("{}_ENV", ENV_PREFIX)).unwrap_or_else(|_| "development".to_string())
}

/// 从配置文件和环境变量加载配置
///
/// 加载顺序（后加载的会覆盖先加载的同名配置项）：
/// 1. {config_dir}/default.toml（默认配置）
/// 2. {config_dir}/{environment}.toml（环境特定配置）
/// 3. {config_dir}/{service_name}.toml（服务特定配置）
/// 4. 环境变量（LOCALE_RULES_ 前缀，层级用 `__` 分隔，如
///    LOCALE_RULES_ENGINE__MAX_VERSION_HISTORY -> engine.max_version_history）
///
/// `config_dir` 默认取 `CONFIG_DIR` 环境变量，未设置时为 `config`。
pub fn load<T: DeserializeOwned>(service_name: &str) -> Result<T, ConfigError> {
    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    load_from(service_name, Path::new(&config_dir))
}

/// 从指定目录加载配置
pub fn load_from<T: DeserializeOwned>(
    service_name: &str,
    config_dir: &Path,
) -> Result<T, ConfigError> {
    let env = environment();

    Config::builder()
        .set_default("service_name", service_name)?
        .set_default("environment", env.clone())?
        .add_source(File::from(config_dir.join("default.toml")).required(false))
        .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
        .add_source(File::from(config_dir.join(format!("{}.toml", service_name))).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
