//! 统一可观测性模块
//!
//! 提供日志和指标的统一初始化。服务通过单一入口点配置可观测性，
//! 保证指标命名一致。

pub mod metrics;
pub mod tracing;

use crate::config::ObservabilityConfig;
use ::tracing::info;
use anyhow::Result;
use std::path::PathBuf;

/// 可观测性资源守卫
///
/// 持有指标 recorder 句柄，Drop 时把指标快照写入配置的文件。
pub struct ObservabilityGuard {
    metrics_handle: Option<self::metrics::MetricsHandle>,
    metrics_path: Option<PathBuf>,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self {
            metrics_handle: None,
            metrics_path: None,
        }
    }

    /// 当前指标的 Prometheus 文本格式
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics_handle.as_ref().map(|h| h.render())
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let (Some(handle), Some(path)) = (&self.metrics_handle, &self.metrics_path) {
            if let Err(e) = std::fs::write(path, handle.render()) {
                eprintln!("Error writing metrics snapshot to {}: {}", path.display(), e);
            }
        }
        info!("Shutting down observability...");
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus recorder，不启动 HTTP 端点）
///
/// # Example
///
/// ```ignore
/// use locale_shared::config::ObservabilityConfig;
/// use locale_shared::observability;
///
/// let config = ObservabilityConfig::default();
/// let _guard = observability::init("locale-rules", &config)?;
/// ```
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    self::tracing::init(config)?;

    let metrics_handle = if config.metrics_enabled {
        Some(self::metrics::init(service_name)?)
    } else {
        None
    };

    info!(
        service = %service_name,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Observability initialized"
    );

    Ok(ObservabilityGuard {
        metrics_handle,
        metrics_path: config.metrics_path.as_ref().map(PathBuf::from),
    })
}
