//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 收集指标。
//! 服务以批处理方式运行，指标在退出时以文本格式写出，不暴露 HTTP 端点。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源句柄
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// 安装 Prometheus recorder 并描述业务指标
pub fn init(service_name: &str) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // 保存到全局，供其他地方获取指标快照
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_metrics(service_name);

    Ok(MetricsHandle { handle })
}

/// 注册业务指标描述
///
/// 这些描述会出现在渲染结果的 HELP 注释中。未安装 recorder 时调用无副作用。
pub fn register_metrics(service_name: &str) {
    metrics::describe_counter!(
        "localization_evaluations_total",
        "Total number of localization evaluations"
    );
    metrics::describe_counter!(
        "localization_rules_fired_total",
        "Total number of fired localization rules by category"
    );
    metrics::describe_histogram!(
        "localization_evaluation_duration_seconds",
        "Localization evaluation duration in seconds"
    );
    metrics::describe_counter!(
        "localization_ab_impressions_total",
        "Total number of A/B variant impressions"
    );
    metrics::describe_counter!(
        "localization_advisory_failures_total",
        "Total number of failed or timed out advisory calls"
    );

    // 记录服务启动
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}
